use munkres::{solve_assignment, WeightMatrix};
use ndarray::Array2;

use crate::error::Error;

// Stand-in weight for forbidden pairings and square padding. The Hungarian
// reduction cannot subtract infinities, so non-finite entries are replaced
// before solving and callers filter the returned links by the original cost.
const DISALLOWED: f64 = 1.0e9;

/// One row/column pairing chosen by the solver, with the cost taken from
/// the original (un-padded) matrix. A non-finite cost means the solver was
/// forced into a forbidden pairing by the matrix shape; it is not a link.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub row: usize,
    pub col: usize,
    pub cost: f64,
}

impl Link {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.cost.is_finite()
    }
}

/// Optimal one-to-one assignment minimizing total finite cost over a
/// rectangular cost matrix. Pure and deterministic.
pub fn solve(costs: &Array2<f64>) -> Result<Vec<Link>, Error> {
    let (rows, cols) = costs.dim();
    if rows == 0 || cols == 0 {
        return Ok(Vec::new());
    }

    let n = rows.max(cols);
    let mut data = Vec::with_capacity(n * n);
    for r in 0..n {
        for c in 0..n {
            let w = if r < rows && c < cols {
                costs[[r, c]]
            } else {
                f64::INFINITY
            };
            data.push(if w.is_finite() { w } else { DISALLOWED });
        }
    }
    let mut mat = WeightMatrix::from_row_vec(n, data);

    let positions = solve_assignment(&mut mat).map_err(|_| Error::AssignmentUnsolvable)?;

    Ok(positions
        .into_iter()
        .filter(|p| p.row < rows && p.column < cols)
        .map(|p| Link {
            row: p.row,
            col: p.column,
            cost: costs[[p.row, p.column]],
        })
        .collect())
}
