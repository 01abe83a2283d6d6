//! CSV sinks for Cypher `LOAD CSV` sources and openCypher bulk-loader files.

use crate::records::{
    cell_text, citation_edges, node_records, BulkEdgeRow, BulkNodeRow, CitationEdge, CsvRow,
    IdEdgeRow, IdNodeRow, NodeRecord, PlainEdgeRow,
};
use crate::snapshot::{load_snapshot, EdgeSnapshot, NodeSnapshot, OrderedMap};
use crate::stats::{progress_bar, LoadStats};
use anyhow::{Context, Result};
use csv::WriterBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{create_dir_all, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

enum OutputFile {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl OutputFile {
    fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
            }
        }
        let file = BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        );
        if path.extension().map_or(false, |ext| ext == "gz") {
            Ok(OutputFile::Gzip(GzEncoder::new(file, Compression::default())))
        } else {
            Ok(OutputFile::Plain(file))
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            OutputFile::Plain(mut w) => w.flush(),
            OutputFile::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputFile::Plain(w) => w.write(buf),
            OutputFile::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputFile::Plain(w) => w.flush(),
            OutputFile::Gzip(w) => w.flush(),
        }
    }
}

/// A CSV file with a header row and no index column; `.gz` paths are compressed.
pub struct CsvSink {
    writer: csv::Writer<OutputFile>,
    path: PathBuf,
    rows: usize,
}

impl CsvSink {
    /// Open `path` and write `header` before any row.
    pub fn create<I, S>(path: &Path, header: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(OutputFile::create(path)?);
        let mut sink = Self {
            writer,
            path: path.to_path_buf(),
            rows: 0,
        };
        // A table with no columns at all stays empty.
        let mut header = header.into_iter().peekable();
        if header.peek().is_some() {
            sink.writer
                .write_record(header)
                .with_context(|| format!("write CSV header of {}", path.display()))?;
        }
        Ok(sink)
    }

    pub fn for_rows<T: CsvRow>(path: &Path) -> Result<Self> {
        Self::create(path, T::HEADER)
    }

    /// Serialize a row struct under the header written at creation.
    pub fn serialize<T: Serialize>(&mut self, row: &T) -> Result<()> {
        self.writer
            .serialize(row)
            .with_context(|| format!("serialize CSV row #{} of {}", self.rows + 1, self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    fn write_cells<I, S>(&mut self, cells: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer
            .write_record(cells)
            .with_context(|| format!("write CSV row #{} of {}", self.rows + 1, self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush everything to disk and return the number of data rows.
    pub fn finish(self) -> Result<usize> {
        let path = self.path;
        let output = self
            .writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flush {}", path.display()))?;
        output
            .finish()
            .with_context(|| format!("close {}", path.display()))?;
        Ok(self.rows)
    }
}

// ====== LOAD CSV SOURCES ======

/// Column union of all records, in first-seen order.
fn table_columns(records: &[NodeRecord]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.properties.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.to_string());
            }
        }
    }
    columns
}

/// Write node records as one table; records lacking a column get an empty cell.
pub fn write_node_table(path: &Path, records: impl IntoIterator<Item = NodeRecord>) -> Result<usize> {
    let records: Vec<NodeRecord> = records.into_iter().collect();
    let columns = table_columns(&records);

    let mut sink = CsvSink::create(path, &columns)?;
    for record in &records {
        sink.write_cells(columns.iter().map(|column| {
            record
                .properties
                .get(column)
                .map(cell_text)
                .unwrap_or_default()
        }))?;
    }
    sink.finish()
}

/// Write citation edges with `src_ID`/`dst_ID` endpoint columns.
pub fn write_citation_table(
    path: &Path,
    edges: impl IntoIterator<Item = Result<CitationEdge>>,
) -> Result<usize> {
    let mut sink = CsvSink::for_rows::<PlainEdgeRow>(path)?;
    for edge in edges {
        sink.serialize(&PlainEdgeRow::from(&edge?))?;
    }
    sink.finish()
}

/// `<input>.csv`, next to the snapshot.
pub fn default_table_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".csv");
    PathBuf::from(name)
}

pub fn export_node_table(input: &Path, output: &Path, stats: &LoadStats) -> Result<usize> {
    let snapshot: NodeSnapshot = load_snapshot(input)?;
    if snapshot.is_empty() {
        warn!("{} holds no nodes", input.display());
    }
    info!("data length: {}", snapshot.len());

    let rows = write_node_table(output, node_records(&snapshot))?;
    LoadStats::add(&stats.files_processed, 1);
    LoadStats::add(&stats.nodes_written, rows);
    LoadStats::add(&stats.csv_rows, rows);
    info!("Wrote {} node rows to {}", rows, output.display());
    Ok(rows)
}

pub fn export_citation_table(input: &Path, output: &Path, stats: &LoadStats) -> Result<usize> {
    let snapshot: EdgeSnapshot = load_snapshot(input)?;

    let rows = write_citation_table(output, citation_edges(&snapshot, stats))?;
    LoadStats::add(&stats.files_processed, 1);
    LoadStats::add(&stats.edges_written, rows);
    LoadStats::add(&stats.csv_rows, rows);
    info!("Wrote {} citation rows to {}", rows, output.display());
    Ok(rows)
}

// ====== BULK LOADER FILES ======

#[derive(Debug, Clone)]
pub struct BulkExport {
    pub label: String,
    pub rel_type: String,
    /// Write only the id/label/type columns.
    pub ids_only: bool,
    /// Snapshot files decoded at once.
    pub workers: usize,
}

/// Decode `files` in parallel windows of `workers`, handing snapshots on in file order.
fn for_each_snapshot<V, F>(files: &[PathBuf], workers: usize, unit: &str, mut f: F) -> Result<()>
where
    V: DeserializeOwned + Send,
    F: FnMut(&Path, OrderedMap<V>) -> Result<()>,
{
    let progress = progress_bar(files.len(), unit)?;
    progress.set_message(format!("Decoding {} files at a time...", workers.max(1)));

    for window in files.chunks(workers.max(1)) {
        let snapshots: Vec<OrderedMap<V>> = window
            .par_iter()
            .map(|path| load_snapshot(path))
            .collect::<Result<_>>()?;

        for (path, snapshot) in window.iter().zip(snapshots) {
            f(path, snapshot)?;
            progress.inc(1);
        }
    }

    progress.finish_with_message("Snapshot files exported");
    Ok(())
}

pub fn export_bulk_nodes(
    files: &[PathBuf],
    output: &Path,
    options: &BulkExport,
    stats: &LoadStats,
) -> Result<usize> {
    info!("Exporting {} node files to {}", files.len(), output.display());
    let mut sink = if options.ids_only {
        CsvSink::for_rows::<IdNodeRow>(output)?
    } else {
        CsvSink::for_rows::<BulkNodeRow>(output)?
    };

    for_each_snapshot(files, options.workers, "node files", |path, snapshot: NodeSnapshot| {
        for (key, attrs) in snapshot.iter() {
            if options.ids_only {
                sink.serialize(&IdNodeRow {
                    id: key.to_string(),
                    label: options.label.clone(),
                })?;
            } else {
                sink.serialize(&BulkNodeRow::new(key, attrs, &options.label))?;
            }
        }
        LoadStats::add(&stats.nodes_written, snapshot.len());
        LoadStats::add(&stats.files_processed, 1);
        info!("{}: {} nodes", path.display(), snapshot.len());
        Ok(())
    })?;

    let rows = sink.finish()?;
    LoadStats::add(&stats.csv_rows, rows);
    Ok(rows)
}

pub fn export_bulk_edges(
    files: &[PathBuf],
    output: &Path,
    options: &BulkExport,
    stats: &LoadStats,
) -> Result<usize> {
    info!("Exporting {} citation files to {}", files.len(), output.display());
    let mut sink = if options.ids_only {
        CsvSink::for_rows::<IdEdgeRow>(output)?
    } else {
        CsvSink::for_rows::<BulkEdgeRow>(output)?
    };

    for_each_snapshot(files, options.workers, "citation files", |path, snapshot: EdgeSnapshot| {
        let mut written = 0;
        for edge in citation_edges(&snapshot, stats) {
            let edge = edge.with_context(|| format!("in {}", path.display()))?;
            if options.ids_only {
                sink.serialize(&IdEdgeRow::new(&edge, &options.rel_type))?;
            } else {
                sink.serialize(&BulkEdgeRow::new(&edge, &options.rel_type))?;
            }
            written += 1;
        }
        LoadStats::add(&stats.edges_written, written);
        LoadStats::add(&stats.files_processed, 1);
        info!("{}: {} citations", path.display(), written);
        Ok(())
    })?;

    let rows = sink.finish()?;
    LoadStats::add(&stats.csv_rows, rows);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tests_support::{edge_snapshot, node_snapshot};
    use crate::snapshot::tests::{dict, s, write_pickle};
    use flate2::read::GzDecoder;
    use serde_pickle::Value;
    use std::io::Read;

    fn read_table(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().iter().map(String::from).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        (headers, rows)
    }

    #[test]
    fn node_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.csv");

        let mut snapshot = node_snapshot(2);
        let extra: crate::snapshot::Attributes =
            vec![("decision_date", s("1973-03-22")), ("title", Value::None)]
                .into_iter()
                .collect();
        snapshot.insert("K2", extra);

        let rows = write_node_table(&path, node_records(&snapshot)).unwrap();
        assert_eq!(rows, 3);

        let (headers, rows) = read_table(&path);
        assert_eq!(headers, vec!["title", "court_name", "ID", "decision_date"]);
        assert_eq!(rows[0], vec!["Case 0", "Supreme Court", "K0", ""]);
        assert_eq!(rows[2], vec!["None", "", "K2", "1973-03-22"]);
    }

    #[test]
    fn citation_table_has_endpoint_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cite.csv");
        let snapshot = edge_snapshot();
        let stats = LoadStats::new();

        let rows = write_citation_table(&path, citation_edges(&snapshot, &stats)).unwrap();
        assert_eq!(rows, 3);

        let (headers, rows) = read_table(&path);
        assert_eq!(
            headers,
            vec![
                "src_ID",
                "dst_ID",
                "is_in_headnote",
                "is_in_footnote",
                "is_in_overview",
                "is_in_rfc",
                "is_in_opinion",
                "count"
            ]
        );
        assert_eq!(rows[1], vec!["A", "C", "true", "false", "false", "true", "true", "2"]);
    }

    #[test]
    fn table_path_appends_extension() {
        assert_eq!(
            default_table_path(Path::new("data/part_1_graph_metadata.pkl")),
            PathBuf::from("data/part_1_graph_metadata.pkl.csv")
        );
    }

    fn write_parts(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let node_files = vec![dir.join("part_1_graph_metadata.pkl"), dir.join("part_2_graph_metadata.pkl.gz")];
        write_pickle(
            &node_files[0],
            &dict(vec![(
                "N1",
                dict(vec![
                    ("title", s("First")),
                    ("court_name", s("Court")),
                    ("jurisinfo_system_code", s("US")),
                    ("decision_date", s("1973-03-22")),
                ]),
            )]),
        );
        write_pickle(&node_files[1], &dict(vec![("N2", dict(vec![("title", s("Second"))]))]));

        let edge_files = vec![dir.join("part_1_graph_cite.pkl")];
        write_pickle(
            &edge_files[0],
            &dict(vec![(
                "N1",
                Value::List(vec![
                    dict(vec![
                        ("dest_lni", s("N2")),
                        ("is_in_rfc", Value::Bool(true)),
                        ("count", Value::I64(2)),
                    ]),
                    dict(vec![("count", Value::I64(1))]),
                ]),
            )]),
        );
        (node_files, edge_files)
    }

    #[test]
    fn bulk_files_use_loader_headers() {
        let dir = tempfile::tempdir().unwrap();
        let (node_files, edge_files) = write_parts(dir.path());
        let stats = LoadStats::new();
        let options = BulkExport {
            label: "Case".to_string(),
            rel_type: "REF".to_string(),
            ids_only: false,
            workers: 2,
        };

        let nodes_path = dir.path().join("out/nodes.csv");
        assert_eq!(export_bulk_nodes(&node_files, &nodes_path, &options, &stats).unwrap(), 2);
        let (headers, rows) = read_table(&nodes_path);
        assert_eq!(
            headers,
            vec![
                ":ID",
                ":LABEL",
                "title:String",
                "court_name:String",
                "jurisinfo_system_code:String",
                "decision_date:DateTime"
            ]
        );
        assert_eq!(rows[0], vec!["N1", "Case", "First", "Court", "US", "1973-03-22"]);
        assert_eq!(rows[1], vec!["N2", "Case", "Second", "", "", ""]);

        let edges_path = dir.path().join("out/edges.csv");
        assert_eq!(export_bulk_edges(&edge_files, &edges_path, &options, &stats).unwrap(), 1);
        let (headers, rows) = read_table(&edges_path);
        assert_eq!(&headers[..4], &[":ID", ":START_ID", ":END_ID", ":TYPE"]);
        assert_eq!(headers[9], "count:Int");
        assert_eq!(
            rows[0],
            vec!["N1-N2", "N1", "N2", "REF", "false", "false", "false", "true", "false", "2"]
        );
        assert_eq!(stats.edges_skipped.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn ids_only_bulk_files() {
        let dir = tempfile::tempdir().unwrap();
        let (node_files, edge_files) = write_parts(dir.path());
        let stats = LoadStats::new();
        let options = BulkExport {
            label: "Case".to_string(),
            rel_type: "REF".to_string(),
            ids_only: true,
            workers: 1,
        };

        let nodes_path = dir.path().join("easy_result.csv");
        export_bulk_nodes(&node_files, &nodes_path, &options, &stats).unwrap();
        let (headers, rows) = read_table(&nodes_path);
        assert_eq!(headers, vec![":ID", ":LABEL"]);
        assert_eq!(rows, vec![vec!["N1", "Case"], vec!["N2", "Case"]]);

        let edges_path = dir.path().join("easy_edges.csv");
        export_bulk_edges(&edge_files, &edges_path, &options, &stats).unwrap();
        let (headers, rows) = read_table(&edges_path);
        assert_eq!(headers, vec![":ID", ":START_ID", ":END_ID", ":TYPE"]);
        assert_eq!(rows, vec![vec!["N1-N2", "N1", "N2", "REF"]]);
    }

    #[test]
    fn gzip_output_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.csv.gz");
        write_node_table(&path, node_records(&node_snapshot(1))).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "title,court_name,ID\nCase 0,Supreme Court,K0\n");
    }

    fn serialized_header<T: CsvRow>(row: &T) -> String {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(row).unwrap();
        let bytes = writer.into_inner().map_err(|e| e.into_error()).unwrap();
        String::from_utf8(bytes).unwrap().lines().next().unwrap().to_string()
    }

    #[test]
    fn fixed_headers_match_field_names() {
        let snapshot = edge_snapshot();
        let stats = LoadStats::new();
        let edge = citation_edges(&snapshot, &stats).next().unwrap().unwrap();
        let attrs = crate::snapshot::Attributes::new();

        assert_eq!(
            serialized_header(&PlainEdgeRow::from(&edge)),
            PlainEdgeRow::HEADER.join(",")
        );
        assert_eq!(
            serialized_header(&BulkEdgeRow::new(&edge, "REF")),
            BulkEdgeRow::HEADER.join(",")
        );
        assert_eq!(
            serialized_header(&IdEdgeRow::new(&edge, "REF")),
            IdEdgeRow::HEADER.join(",")
        );
        assert_eq!(
            serialized_header(&BulkNodeRow::new("K", &attrs, "Case")),
            BulkNodeRow::HEADER.join(",")
        );
        assert_eq!(
            serialized_header(&IdNodeRow {
                id: "K".to_string(),
                label: "Case".to_string(),
            }),
            IdNodeRow::HEADER.join(",")
        );
    }

    #[test]
    fn edge_files_keep_header_when_every_item_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("part_1_graph_cite.pkl");
        write_pickle(
            &input,
            &dict(vec![("A2", Value::List(vec![dict(vec![("count", Value::I64(1))])]))]),
        );
        let stats = LoadStats::new();

        let table = dir.path().join("cite.csv");
        assert_eq!(export_citation_table(&input, &table, &stats).unwrap(), 0);
        assert_eq!(
            std::fs::read_to_string(&table).unwrap(),
            format!("{}\n", PlainEdgeRow::HEADER.join(","))
        );

        let mut options = BulkExport {
            label: "Case".to_string(),
            rel_type: "REF".to_string(),
            ids_only: false,
            workers: 1,
        };
        let bulk = dir.path().join("edges.csv");
        assert_eq!(export_bulk_edges(&[input.clone()], &bulk, &options, &stats).unwrap(), 0);
        assert_eq!(
            std::fs::read_to_string(&bulk).unwrap(),
            format!("{}\n", BulkEdgeRow::HEADER.join(","))
        );

        options.ids_only = true;
        export_bulk_edges(&[input], &bulk, &options, &stats).unwrap();
        assert_eq!(
            std::fs::read_to_string(&bulk).unwrap(),
            ":ID,:START_ID,:END_ID,:TYPE\n"
        );
        assert_eq!(stats.edges_skipped.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[test]
    fn empty_node_snapshot_still_gets_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("part_1_graph_metadata.pkl");
        write_pickle(&input, &dict(vec![]));
        let options = BulkExport {
            label: "Case".to_string(),
            rel_type: "REF".to_string(),
            ids_only: false,
            workers: 1,
        };

        let output = dir.path().join("nodes.csv");
        export_bulk_nodes(&[input], &output, &options, &LoadStats::new()).unwrap();
        let (headers, rows) = read_table(&output);
        assert_eq!(headers, BulkNodeRow::HEADER);
        assert!(rows.is_empty());
    }
}
