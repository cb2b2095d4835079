//! Sequential scan over a heap file.

use marrow_common::constants::{RM_FIRST_RECORD_PAGE, RM_NO_PAGE};
use marrow_common::{MarrowResult, Rid};

use super::file::HeapFile;
use super::page::{Bitmap, RM_PAGE_HDR_SIZE};

/// Walks every occupied slot of a heap file in `(page_no, slot_no)` order.
pub struct HeapScan<'a> {
    file: &'a HeapFile,
    rid: Rid,
}

impl<'a> HeapScan<'a> {
    /// Positions the scan on the first occupied slot, or at the end for
    /// an empty file.
    pub fn new(file: &'a HeapFile) -> MarrowResult<Self> {
        let mut scan = Self {
            file,
            rid: Rid::new(RM_FIRST_RECORD_PAGE, -1),
        };
        scan.advance()?;
        Ok(scan)
    }

    /// Moves to the next occupied slot.
    pub fn next(&mut self) -> MarrowResult<()> {
        if !self.is_end() {
            self.advance()?;
        }
        Ok(())
    }

    /// Whether the scan has run off the end of the file.
    pub fn is_end(&self) -> bool {
        self.rid.page_no == RM_NO_PAGE
    }

    /// The current position. Only meaningful while `!is_end()`.
    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// Finds the next set bitmap bit at or after the current position.
    fn advance(&mut self) -> MarrowResult<()> {
        let num_pages = self.file.num_pages();
        let mut page_no = self.rid.page_no;
        let mut slot_no = self.rid.slot_no;

        while page_no < num_pages {
            let found = self.file.with_page(page_no, |hdr, data| {
                let per_page = hdr.num_records_per_page as usize;
                let bitmap = &data[RM_PAGE_HDR_SIZE..RM_PAGE_HDR_SIZE + hdr.bitmap_size as usize];
                let next = Bitmap::next_bit(true, bitmap, per_page, slot_no);
                (next < per_page).then_some(next)
            })?;
            if let Some(slot) = found {
                self.rid = Rid::new(page_no, slot as i32);
                return Ok(());
            }
            page_no += 1;
            slot_no = -1;
        }
        self.rid = Rid::new(RM_NO_PAGE, -1);
        Ok(())
    }
}
