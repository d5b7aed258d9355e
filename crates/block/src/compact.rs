//! Compaction heuristics.
//!
//! Compaction copies blocks from the end of the file toward the start,
//! then truncates the reclaimed tail. The block manager's part is
//! deciding whether the avail-list geometry makes that worthwhile, and
//! judging individual blocks; actually rewriting pages is the tree
//! layer's job.

use crate::addr::Addr;
use shale_core::Result;

const MEGABYTE: u64 = 1 << 20;

impl crate::manager::BlockManager {
    /// Start compacting: force first-fit allocation so rewritten
    /// blocks land at the start of the file.
    pub fn compact_start(&self) -> Result<()> {
        self.configure_first_fit(true);
        self.live().compact_pct_tenths = 0;
        Ok(())
    }

    /// End compacting and restore the configured allocation plan.
    pub fn compact_end(&self) -> Result<()> {
        self.configure_first_fit(false);
        self.live().compact_pct_tenths = 0;
        Ok(())
    }

    /// Decide whether compacting this file is worthwhile.
    ///
    /// Returns `true` to skip. Small files are skipped, as are files
    /// unlikely to give back 10%: if at least 20% of the file is free
    /// space sitting in the first 80%, compaction targets the last
    /// 20%; else if at least 10% is free in the first 90%, the last
    /// 10%; else skip.
    pub fn compact_skip(&self) -> Result<bool> {
        self.latch().check()?;
        let mut live = self.live();
        let file_size = live.file_size;

        if file_size <= MEGABYTE {
            return Ok(true);
        }

        // Sum the available bytes in the first 80% and 90% of the file.
        let ninety = file_size - file_size / 10;
        let eighty = file_size - (file_size / 10) * 2;
        let mut avail_eighty = 0u64;
        let mut avail_ninety = 0u64;
        for (off, size) in live.ckpt.avail.iter() {
            if off < ninety {
                avail_ninety += size;
                if off < eighty {
                    avail_eighty += size;
                }
            }
        }

        tracing::debug!(
            target: "shale::block",
            file = %self.name(),
            file_size,
            avail_eighty,
            avail_ninety,
            "compaction estimate"
        );

        // Require at least a megabyte back. More aggressive targets
        // have diminishing returns; a mostly-empty file is cheap to
        // process anyway.
        let skip = if avail_eighty > MEGABYTE && avail_eighty >= (file_size / 10) * 2 {
            live.compact_pct_tenths = 2;
            false
        } else if avail_ninety > MEGABYTE && avail_ninety >= file_size / 10 {
            live.compact_pct_tenths = 1;
            false
        } else {
            live.compact_pct_tenths = 0;
            true
        };
        Ok(skip)
    }

    /// Decide whether rewriting one block would help shrink the file.
    ///
    /// Returns `false` ("please rewrite") iff the block sits past the
    /// chosen percentage mark and the avail list has a large-enough
    /// range before that mark; without such a range the rewrite would
    /// just extend the file.
    pub fn compact_page_skip(&self, addr: &Addr) -> Result<bool> {
        self.latch().check()?;
        let live = self.live();
        let limit = live.file_size - (live.file_size / 10) * live.compact_pct_tenths;
        if addr.off <= limit {
            return Ok(true);
        }
        for (off, size) in live.ckpt.avail.iter() {
            if off >= limit {
                break;
            }
            if size >= addr.size as u64 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
