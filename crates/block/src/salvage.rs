//! File salvage.
//!
//! Salvage walks a damaged file one allocation unit at a time, looking
//! for spans that still parse as blocks. Every candidate is offered to
//! the caller, which keeps or rejects it; rejected spans and garbage
//! are freed so the rebuilt file can reuse them. Salvage ends with a
//! fresh descriptor and an ordinary live checkpoint ready to roll
//! forward.

use crate::addr::Addr;
use crate::fmt::{BlockHeader, FileDesc, PageHeader};
use crate::manager::BlockCkpt;
use shale_core::Result;
use std::os::unix::fs::FileExt;

impl crate::manager::BlockManager {
    /// Start a salvage pass.
    ///
    /// Rewrites the descriptor block, truncates the file to a whole
    /// number of allocation units (trailing bytes are garbage by
    /// definition) and puts the entire file on the allocation list;
    /// spans nobody wants are freed back off it as the scan runs.
    pub fn salvage_start(&self) -> Result<()> {
        let allocsize = self.allocsize() as u64;
        tracing::debug!(target: "shale::block", file = %self.name(), "salvage start");

        let desc = FileDesc::new().to_block(self.allocsize());
        self.file_ref().write_all_at(&desc, 0)?;
        self.file_ref().sync_all()?;

        let mut live = self.live();
        live.ckpt = BlockCkpt::new("live");
        live.live_open = true;

        let len = (live.file_size / allocsize * allocsize).max(allocsize);
        if len != live.file_size {
            self.truncate_file(&mut live, len)?;
        }
        live.file_size = len;
        live.ckpt.file_size = len;

        // The first unit is the descriptor, skip it.
        live.slvg_off = allocsize;
        if len > allocsize {
            live.ckpt
                .alloc
                .insert(allocsize, len - allocsize)
                .map_err(|e| self.escalate(e))?;
        }
        Ok(())
    }

    /// Return the next candidate block, or `None` at end of file.
    ///
    /// Reads one allocation unit, takes a size and checksum from the
    /// block header it may contain, and verifies the full block. Spans
    /// that don't verify are freed and skipped.
    pub fn salvage_next(&self) -> Result<Option<(Addr, PageHeader)>> {
        let allocsize = self.allocsize() as u64;
        let mut unit = vec![0u8; self.allocsize() as usize];

        loop {
            let (offset, file_size) = {
                let live = self.live();
                (live.slvg_off, live.file_size)
            };
            if offset >= file_size {
                return Ok(None);
            }

            self.file_ref().read_exact_at(&mut unit, offset)?;
            let blk = BlockHeader::read_from(&unit)?;
            let size = blk.disk_size;
            let cksum = blk.cksum;

            let plausible = {
                let live = self.live();
                !self.offset_invalid(&live, offset, size)
            };
            if plausible {
                let addr = Addr::new(offset, size, cksum);
                if let Ok(block) = self.read_quiet(&addr) {
                    let header = PageHeader::read_from(&block)?;
                    return Ok(Some((addr, header)));
                }
            }

            // Not a block; free the unit and move to the next boundary.
            tracing::debug!(
                target: "shale::block",
                file = %self.name(), offset, "salvage skipping unit"
            );
            let mut live = self.live();
            self.off_free(&mut live, offset, allocsize)?;
            live.slvg_off = offset + allocsize;
        }
    }

    /// Record the caller's verdict on the candidate at `addr`.
    ///
    /// A kept block advances the scan past it; a rejected block frees
    /// one allocation unit and advances one unit (the caller may have
    /// taken a later block that overlaps the rest).
    pub fn salvage_valid(&self, addr: &Addr, valid: bool) -> Result<()> {
        let allocsize = self.allocsize() as u64;
        let mut live = self.live();
        if valid {
            live.slvg_off = addr.end();
        } else {
            self.off_free(&mut live, addr.off, allocsize)?;
            live.slvg_off = addr.off + allocsize;
        }
        Ok(())
    }

    /// End the salvage pass, discarding the scan state.
    pub fn salvage_end(&self) -> Result<()> {
        tracing::debug!(target: "shale::block", file = %self.name(), "salvage end");
        self.checkpoint_unload()
    }
}
