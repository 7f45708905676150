//! Structural verification and self-repair of bucket contents.
//!
//! Two classes of corruption are recognised: a non-empty cell whose address
//! falls in the reserved sentinel range, and two field-wise-equal non-empty
//! cells in one bucket. Repair zeroes every cell involved; for duplicates
//! that means *both* copies go (a lost entry costs a missed dedup, an
//! ambiguous one costs wrong sharing decisions).

use nectar_util::Counters;
use tracing::warn;

use crate::addr::BlockAddr;
use crate::layout::Cell;

use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Scan one bucket's cells. Returns whether any violation was found; with
/// `repair` set, offending cells are zeroed in place.
///
/// Must be called with the bucket mutex held.
pub(crate) fn verify_cells(cells: &mut [Cell], repair: bool, counters: &Counters) -> bool {
    let mut bugs_found = false;

    for cell in cells.iter_mut() {
        let addr = cell.addr;
        if addr.raw() != 0 && addr.is_magic() {
            counters.count("bug_hash_magic_addr");
            let hash = format!("{:#x}", cell.hash);
            warn!(%hash, %addr, "cell with reserved address");
            if repair {
                *cell = Cell::EMPTY;
            }
            bugs_found = true;
        }
    }

    let mut seen: HashMap<Cell, usize> = HashMap::new();
    for i in 0..cells.len() {
        let cell = cells[i];
        if cell.addr.raw() == 0 {
            continue;
        }
        match seen.entry(cell) {
            Entry::Occupied(first) => {
                counters.count("bug_hash_duplicate_cell");
                let hash = format!("{:#x}", cell.hash);
                warn!(%hash, addr = %cell.addr, "duplicate cells in bucket");
                if repair {
                    cells[*first.get()] = Cell::EMPTY;
                    cells[i] = Cell::EMPTY;
                }
                bugs_found = true;
            }
            Entry::Vacant(slot) => {
                slot.insert(i);
            }
        }
    }

    bugs_found
}
