//! Little-endian reader shared by the persisted index layouts

use crate::index::error::{IndexError, IndexResult};

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    /// `what` names the layout in corruption errors
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    pub(crate) fn bytes(&mut self, n: usize) -> IndexResult<&'a [u8]> {
        let end = self.pos.saturating_add(n);
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            IndexError::Corruption(format!("{} truncated at byte {}", self.what, self.pos))
        })?;
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> IndexResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> IndexResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> IndexResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// `u16` length followed by UTF-8 bytes
    pub(crate) fn string(&mut self) -> IndexResult<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| IndexError::Corruption(format!("{}: {}", self.what, e)))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}
