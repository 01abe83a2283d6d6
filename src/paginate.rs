/// Default number of records submitted per bulk-merge call.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Splits an iterator into ordered pages of at most `page_size` items.
///
/// The underlying iterator is consumed once; the first empty page ends the
/// sequence, so the last page may be shorter than `page_size`.
pub struct Pages<I> {
    inner: I,
    page_size: usize,
}

impl<I: Iterator> Iterator for Pages<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let page: Vec<I::Item> = self.inner.by_ref().take(self.page_size).collect();
        if page.is_empty() {
            None
        } else {
            Some(page)
        }
    }
}

pub trait Paginate: Iterator + Sized {
    /// A page size of 0 is treated as 1.
    fn pages(self, page_size: usize) -> Pages<Self> {
        Pages {
            inner: self,
            page_size: page_size.max(1),
        }
    }
}

impl<I: Iterator> Paginate for I {}

/// Number of pages needed for `len` records.
pub fn page_count(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_cover_input_in_order() {
        for (n, p) in [(0, 3), (1, 3), (7, 3), (9, 3), (2500, 1000), (1000, 1000)] {
            let pages: Vec<Vec<usize>> = (0..n).pages(p).collect();

            assert_eq!(pages.len(), page_count(n, p), "n={} p={}", n, p);
            if let Some((last, full)) = pages.split_last() {
                assert!(full.iter().all(|page| page.len() == p));
                let expected_last = if n % p == 0 { p } else { n % p };
                assert_eq!(last.len(), expected_last);
            }
            let flat: Vec<usize> = pages.into_iter().flatten().collect();
            assert_eq!(flat, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn zero_page_size_still_progresses() {
        let pages: Vec<Vec<char>> = "abc".chars().pages(0).collect();
        assert_eq!(pages, vec![vec!['a'], vec!['b'], vec!['c']]);
    }

    #[test]
    fn consumes_source_once() {
        let mut pulled = 0;
        let source = (0..5).inspect(|_| pulled += 1);
        let total: usize = source.pages(2).map(|page| page.len()).sum();
        assert_eq!(total, 5);
        assert_eq!(pulled, 5);
    }
}
