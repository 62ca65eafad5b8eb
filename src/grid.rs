//! First-fit placement of dashboard cards onto a fixed-width grid.

use crate::models::{CardSize, GridLayout, GridPlacement, PlacedCard};

/// Rectangles claimed so far, in grid cells (0-indexed, end-exclusive rows).
/// Rows are `u64` so a tall span cannot overflow.
#[derive(Debug)]
struct Occupancy {
    columns: u64,
    claimed: Vec<Claim>,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    row: u64,
    col: u64,
    col_span: u64,
    row_span: u64,
}

impl Claim {
    fn bottom(&self) -> u64 {
        self.row + self.row_span
    }

    fn overlaps(&self, other: &Claim) -> bool {
        self.col < other.col + other.col_span
            && other.col < self.col + self.col_span
            && self.row < other.bottom()
            && other.row < self.bottom()
    }
}

impl Occupancy {
    fn new(columns: u32) -> Self {
        Self {
            columns: u64::from(columns),
            claimed: Vec::new(),
        }
    }

    fn rows(&self) -> u64 {
        self.claimed.iter().map(Claim::bottom).max().unwrap_or(0)
    }

    fn fits(&self, candidate: &Claim) -> bool {
        candidate.col + candidate.col_span <= self.columns
            && !self.claimed.iter().any(|claim| claim.overlaps(candidate))
    }

    /// Lowest row, then lowest column, where the card fits. Only row 0 and the
    /// bottom edges of claimed rectangles can be the first free anchor row, so
    /// the scan never walks empty rows.
    fn first_fit(&self, col_span: u64, row_span: u64) -> Claim {
        let mut anchor_rows: Vec<u64> = self.claimed.iter().map(Claim::bottom).collect();
        anchor_rows.push(0);
        anchor_rows.sort_unstable();
        anchor_rows.dedup();

        for row in anchor_rows.iter().copied() {
            for col in 0..=(self.columns - col_span) {
                let candidate = Claim {
                    row,
                    col,
                    col_span,
                    row_span,
                };
                if self.fits(&candidate) {
                    return candidate;
                }
            }
        }
        // The deepest anchor row lies below every claim, so the loop returns.
        Claim {
            row: self.rows(),
            col: 0,
            col_span,
            row_span,
        }
    }

    fn claim(&mut self, claim: Claim) {
        self.claimed.push(claim);
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Places cards in input order, each at the first free anchor of a row-major
/// scan. Identical input always yields identical output.
///
/// `size_of` must return a `col_span` no wider than `columns`; callers clamp
/// with [`CardSize::clamped`]. Wider cards are left unplaced. Zero spans are
/// raised to 1. `row_span` is not bounded; work grows with the number of
/// cards, not with their height.
pub fn pack_cards<I, S, F>(card_ids: I, size_of: F, columns: u32) -> GridLayout
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(&str) -> CardSize,
{
    if columns < 1 {
        return GridLayout::default();
    }

    let mut occupancy = Occupancy::new(columns);
    let mut placements = Vec::new();

    for card_id in card_ids {
        let card_id = card_id.as_ref();
        let size = size_of(card_id);
        let col_span = size.col_span.max(1);
        let row_span = size.row_span.max(1);

        if col_span > columns {
            tracing::warn!(card_id = %card_id, col_span, columns, "card wider than grid; not placed");
            continue;
        }

        let claim = occupancy.first_fit(u64::from(col_span), u64::from(row_span));
        occupancy.claim(claim);
        placements.push(PlacedCard {
            card_id: card_id.to_string(),
            placement: GridPlacement {
                row: saturate(claim.row + 1),
                col: saturate(claim.col + 1),
                col_span,
                row_span,
            },
        });
    }

    GridLayout {
        columns,
        rows: saturate(occupancy.rows()),
        placements,
    }
}
