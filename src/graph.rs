//! Bulk upsert of case/paper nodes and citation relationships into Neo4j.
//!
//! Records are merged page by page with `UNWIND ... MERGE` statements keyed by
//! a uniqueness constraint on `(label, property)`.

use crate::paginate::{page_count, Paginate};
use crate::records::{citation_edges, citation_item_count, node_records, CitationEdge, NodeRecord, ID_FIELD};
use crate::snapshot::{EdgeSnapshot, NodeSnapshot};
use crate::stats::{progress_bar, LoadStats};
use anyhow::{Context, Result};
use neo4rs::{query, BoltNull, BoltType, ConfigBuilder, Graph};
use serde_pickle::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Label and property a node is merged on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeKey {
    pub label: String,
    pub property: String,
}

impl NodeKey {
    pub fn new(label: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            property: property.into(),
        }
    }

    /// `label.ID`, the key every snapshot record carries.
    pub fn by_id(label: impl Into<String>) -> Self {
        Self::new(label, ID_FIELD)
    }
}

/// Where pages of records are merged.
pub struct MergeTarget {
    pub key: NodeKey,
    pub rel_type: String,
    pub page_size: usize,
}

// ====== CYPHER STATEMENTS ======

/// Backtick-quote a label, type or property name.
pub fn escape_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn unique_constraint_statement(key: &NodeKey) -> String {
    format!(
        "CREATE CONSTRAINT IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
        escape_identifier(&key.label),
        escape_identifier(&key.property)
    )
}

pub fn merge_nodes_statement(key: &NodeKey) -> String {
    let property = escape_identifier(&key.property);
    format!(
        "UNWIND $rows AS row \
         MERGE (n:{} {{{}: row.{}}}) \
         SET n += row",
        escape_identifier(&key.label),
        property,
        property
    )
}

pub fn merge_relationships_statement(rel_type: &str, start: &NodeKey, end: &NodeKey) -> String {
    format!(
        "UNWIND $rows AS row \
         MERGE (a:{} {{{}: row.src}}) \
         MERGE (b:{} {{{}: row.dst}}) \
         MERGE (a)-[r:{}]->(b) \
         SET r += row.props",
        escape_identifier(&start.label),
        escape_identifier(&start.property),
        escape_identifier(&end.label),
        escape_identifier(&end.property),
        escape_identifier(rel_type)
    )
}

pub fn probe_statement(label: &str) -> String {
    format!("MATCH (c:{}) RETURN c LIMIT $limit", escape_identifier(label))
}

// ====== BOLT CONVERSION ======

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::None => BoltType::Null(BoltNull),
        Value::Bool(b) => (*b).into(),
        Value::I64(i) => (*i).into(),
        Value::Int(i) => i.to_string().into(),
        Value::F64(f) => (*f).into(),
        Value::String(s) => s.clone().into(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned().into(),
        Value::List(items) | Value::Tuple(items) => {
            items.iter().map(to_bolt).collect::<Vec<BoltType>>().into()
        }
        Value::Set(items) | Value::FrozenSet(items) => items
            .iter()
            .map(|item| to_bolt(&item.clone().into_value()))
            .collect::<Vec<BoltType>>()
            .into(),
        Value::Dict(map) => map
            .iter()
            .map(|(k, v)| (crate::records::py_str(&k.clone().into_value()), to_bolt(v)))
            .collect::<HashMap<String, BoltType>>()
            .into(),
    }
}

pub fn node_row(record: &NodeRecord) -> BoltType {
    record
        .properties
        .iter()
        .map(|(k, v)| (k.to_string(), to_bolt(v)))
        .collect::<HashMap<String, BoltType>>()
        .into()
}

pub fn edge_row(edge: &CitationEdge) -> BoltType {
    let p = edge.properties;
    let mut props: HashMap<String, BoltType> = HashMap::new();
    props.insert("is_in_headnote".to_string(), p.is_in_headnote.into());
    props.insert("is_in_footnote".to_string(), p.is_in_footnote.into());
    props.insert("is_in_overview".to_string(), p.is_in_overview.into());
    props.insert("is_in_rfc".to_string(), p.is_in_rfc.into());
    props.insert("is_in_opinion".to_string(), p.is_in_opinion.into());
    props.insert("count".to_string(), p.count.into());

    let mut row: HashMap<String, BoltType> = HashMap::new();
    row.insert("src".to_string(), edge.source.clone().into());
    row.insert("dst".to_string(), edge.destination.clone().into());
    row.insert("props".to_string(), props.into());
    row.into()
}

// ====== BULK MERGE ======

pub trait BulkMerge {
    async fn ensure_unique(&self, key: &NodeKey) -> Result<()>;

    async fn merge_nodes(&self, key: &NodeKey, rows: Vec<NodeRecord>) -> Result<()>;

    async fn merge_relationships(
        &self,
        rel_type: &str,
        start: &NodeKey,
        end: &NodeKey,
        rows: Vec<CitationEdge>,
    ) -> Result<()>;
}

/// Pooled Neo4j connection handle, passed explicitly to every sink call.
pub struct Neo4jSession {
    graph: Graph,
}

impl Neo4jSession {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        info!("Connecting to Neo4j at {} as {}", uri, user);

        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .build()
            .context("failed to build neo4j config")?;

        let graph = Graph::connect(config)
            .await
            .with_context(|| format!("failed to connect to neo4j at {}", uri))?;

        Ok(Self { graph })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl BulkMerge for Neo4jSession {
    async fn ensure_unique(&self, key: &NodeKey) -> Result<()> {
        let statement = unique_constraint_statement(key);
        debug!("{}", statement);
        self.graph
            .run(query(&statement))
            .await
            .with_context(|| format!("failed to create constraint on {}.{}", key.label, key.property))
    }

    async fn merge_nodes(&self, key: &NodeKey, rows: Vec<NodeRecord>) -> Result<()> {
        let rows: Vec<BoltType> = rows.iter().map(node_row).collect();
        let q = query(&merge_nodes_statement(key)).param("rows", rows);
        self.graph.run(q).await.context("bulk node merge failed")
    }

    async fn merge_relationships(
        &self,
        rel_type: &str,
        start: &NodeKey,
        end: &NodeKey,
        rows: Vec<CitationEdge>,
    ) -> Result<()> {
        let rows: Vec<BoltType> = rows.iter().map(edge_row).collect();
        let q = query(&merge_relationships_statement(rel_type, start, end)).param("rows", rows);
        self.graph.run(q).await.context("bulk relationship merge failed")
    }
}

// ====== UPSERT PIPELINES ======

/// Merge every case/paper in `snapshot`, one page per call.
pub async fn upsert_nodes<M: BulkMerge>(
    merge: &M,
    snapshot: &NodeSnapshot,
    target: &MergeTarget,
    stats: &LoadStats,
) -> Result<()> {
    info!(
        "data length: {} ({} pages)",
        snapshot.len(),
        page_count(snapshot.len(), target.page_size)
    );

    let progress = progress_bar(snapshot.len(), "nodes")?;
    progress.set_message(format!("Merging {} nodes...", target.key.label));

    for (index, page) in node_records(snapshot).pages(target.page_size).enumerate() {
        let len = page.len();
        merge
            .merge_nodes(&target.key, page)
            .await
            .with_context(|| format!("node page {}", index))?;

        LoadStats::add(&stats.nodes_written, len);
        LoadStats::add(&stats.pages_submitted, 1);
        progress.inc(len as u64);
    }

    progress.finish_with_message("Node merge complete");
    Ok(())
}

/// Merge every citation in `snapshot` as a relationship between two keyed nodes.
pub async fn upsert_citations<M: BulkMerge>(
    merge: &M,
    snapshot: &EdgeSnapshot,
    target: &MergeTarget,
    stats: &LoadStats,
) -> Result<()> {
    let total = citation_item_count(snapshot);
    info!(
        "citation items: {} (at most {} pages)",
        total,
        page_count(total, target.page_size)
    );

    let progress = progress_bar(total, "citations")?;
    progress.set_message(format!("Merging {} relationships...", target.rel_type));

    for (index, page) in citation_edges(snapshot, stats).pages(target.page_size).enumerate() {
        let page = page.into_iter().collect::<Result<Vec<_>>>()?;
        let len = page.len();
        merge
            .merge_relationships(&target.rel_type, &target.key, &target.key, page)
            .await
            .with_context(|| format!("relationship page {}", index))?;

        LoadStats::add(&stats.edges_written, len);
        LoadStats::add(&stats.pages_submitted, 1);
        progress.inc(len as u64);
    }

    progress.finish_with_message("Relationship merge complete");
    Ok(())
}

/// Time a small read query; returns the number of rows and the elapsed time.
pub async fn probe(session: &Neo4jSession, label: &str, limit: i64) -> Result<(usize, Duration)> {
    let started = Instant::now();
    let q = query(&probe_statement(label)).param("limit", limit);
    let mut result = session.graph().execute(q).await.context("probe query failed")?;

    let mut rows = 0;
    while let Some(_row) = result.next().await? {
        rows += 1;
    }

    Ok((rows, started.elapsed()))
}
