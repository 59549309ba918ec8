//! Ownership wrapper around one raw protocol result.
//!
//! Row decoding belongs to the caller; a `Recordset` only owns the raw
//! result and exposes its cells as bytes.

use bytes::Bytes;

use crate::protocol::{Column, PgResult};

/// Owner of one protocol result. Empty by default; cleared in place when a
/// connection is reused.
#[derive(Debug, Default)]
pub struct Recordset {
    inner: Option<PgResult>,
}

impl Recordset {
    /// Take ownership of a raw result.
    #[must_use]
    pub fn new(result: PgResult) -> Self {
        Self {
            inner: Some(result),
        }
    }

    /// The underlying raw result, when one is held.
    #[must_use]
    pub fn handle(&self) -> Option<&PgResult> {
        self.inner.as_ref()
    }

    /// Release the held result.
    pub fn clear(&mut self) {
        self.inner = None;
    }

    /// Number of rows held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |result| result.rows.len())
    }

    /// True when no rows are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column layout of the held result.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        self.inner
            .as_ref()
            .map_or(&[], |result| result.columns.as_slice())
    }

    /// Raw bytes of one cell; `None` for NULL or out-of-range indices.
    #[must_use]
    pub fn value(&self, row: usize, column: usize) -> Option<&Bytes> {
        self.inner
            .as_ref()?
            .rows
            .get(row)?
            .get(column)?
            .as_ref()
    }
}

impl From<PgResult> for Recordset {
    fn from(result: PgResult) -> Self {
        Self::new(result)
    }
}

#[cfg(test)]
mod test {
    use super::Recordset;
    use crate::protocol::{Column, ExecStatus, PgResult};
    use bytes::Bytes;

    fn one_row() -> PgResult {
        let mut result = PgResult::with_status(ExecStatus::TuplesOk);
        result.columns = vec![Column {
            name: "id".into(),
            type_oid: 23,
            format: 1,
        }];
        result.rows = vec![vec![Some(Bytes::from_static(b"\x00\x00\x00\x2a")), None]];
        result
    }

    #[test]
    fn exposes_rows_and_cells() {
        let recordset = Recordset::new(one_row());

        assert_eq!(recordset.len(), 1);
        assert_eq!(recordset.columns().len(), 1);
        assert_eq!(
            recordset.value(0, 0).map(|cell| cell.as_ref()),
            Some(&b"\x00\x00\x00\x2a"[..])
        );
        assert_eq!(recordset.value(0, 1), None);
        assert_eq!(recordset.value(1, 0), None);
    }

    #[test]
    fn clear_releases_the_result() {
        let mut recordset = Recordset::new(one_row());

        recordset.clear();

        assert!(recordset.is_empty());
        assert!(recordset.handle().is_none());
    }
}
