// Refer: https://github.com/nwtnni/hungarian

use fixedbitset::FixedBitSet;
use log::trace;
use nalgebra as na;
use num_traits::{Bounded, NumAssign, Zero};
use serde::{Deserialize, Serialize};

macro_rules! on {
    ($s:expr, $i:expr) => {
        $s.contains($i)
    };
}

macro_rules! off {
    ($s:expr, $i:expr) => {
        !$s.contains($i)
    };
}

pub type CostMatrix = na::DMatrix<i64>;

/// One cell of a solved square cost matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub row: usize,
    pub col: usize,
    pub cost: i64,
}

pub trait AssignmentSolver: Send + Sync {
    /// Returns a bijection over the rows and columns of the square `cost`
    /// matrix maximizing the total matched cost.
    fn solve(&self, cost: &CostMatrix) -> Vec<Assignment>;
}

/// Kuhn-Munkres solver.
#[derive(Debug, Default, Clone, Copy)]
pub struct HungarianSolver;

impl AssignmentSolver for HungarianSolver {
    fn solve(&self, cost: &CostMatrix) -> Vec<Assignment> {
        let max = cost.iter().copied().max().unwrap_or(0);
        let flipped = cost.map(|c| max - c);

        minimize(&flipped)
            .into_iter()
            .enumerate()
            .map(|(row, col)| Assignment {
                row,
                col,
                cost: cost[(row, col)],
            })
            .collect()
    }
}

/// Minimum-cost perfect matching of a square matrix; `result[row] == col`.
pub fn minimize<N>(matrix: &na::DMatrix<N>) -> Vec<usize>
where
    N: na::Scalar + NumAssign + Bounded + Ord + Copy,
{
    let n = matrix.nrows();
    debug_assert_eq!(n, matrix.ncols(), "cost matrix must be square");

    if n == 0 {
        return Vec::new();
    }

    let mut m = matrix.clone();
    let mut stars = na::DMatrix::repeat(n, n, false);
    let mut primes = na::DMatrix::repeat(n, n, false);
    let mut row_cover = FixedBitSet::with_capacity(n);
    let mut col_cover = FixedBitSet::with_capacity(n);

    for r in 0..n {
        if let Some(min) = m.row(r).iter().copied().min() {
            m.row_mut(r).iter_mut().for_each(|c| *c -= min);
        }
    }

    //********************************************//
    //                                            //
    //                   Step 2                   //
    //                                            //
    //********************************************//

    for i in 0..n {
        for j in 0..n {
            if on!(col_cover, j) {
                continue;
            }

            if m[(i, j)].is_zero() {
                stars[(i, j)] = true;
                col_cover.insert(j);
                break;
            }
        }
    }

    col_cover.clear();
    let mut verify = true;

    loop {
        if verify {
            //********************************************//
            //                                            //
            //                   Step 3                   //
            //                                            //
            //********************************************//

            for j in 0..n {
                if (0..n).any(|i| stars[(i, j)]) {
                    col_cover.insert(j);
                }
            }

            if col_cover.count_ones(..) == n {
                // n starred columns means exactly one star per row.
                return (0..n)
                    .map(|i| {
                        (0..n)
                            .find(|&j| stars[(i, j)])
                            .expect("every row holds a starred zero")
                    })
                    .collect();
            }
        }

        //********************************************//
        //                                            //
        //                   Step 4                   //
        //                                            //
        //********************************************//

        let mut uncovered = None;

        'outer: for i in 0..n {
            if on!(row_cover, i) {
                continue;
            }
            for j in 0..n {
                if on!(col_cover, j) {
                    continue;
                }
                if m[(i, j)].is_zero() {
                    uncovered = Some((i, j));
                    primes[(i, j)] = true;
                    break 'outer;
                }
            }
        }

        let (i, j) = match uncovered {
            Some(cell) => cell,
            None => {
                //********************************************//
                //                                            //
                //                   Step 6                   //
                //                                            //
                //********************************************//

                let mut min = N::max_value();

                for i in (0..n).filter(|&i| off!(row_cover, i)) {
                    for j in (0..n).filter(|&j| off!(col_cover, j)) {
                        let value = m[(i, j)];
                        if value < min {
                            min = value;
                        }
                    }
                }

                for i in (0..n).filter(|&i| on!(row_cover, i)) {
                    m.row_mut(i).iter_mut().for_each(|c| *c += min);
                }

                for j in (0..n).filter(|&j| off!(col_cover, j)) {
                    m.column_mut(j).iter_mut().for_each(|c| *c -= min);
                }

                verify = false;
                continue;
            }
        };

        if let Some(star_col) = (0..n).find(|&c| stars[(i, c)]) {
            row_cover.insert(i);
            col_cover.set(star_col, false);
            verify = false;
            continue;
        }

        //********************************************//
        //                                            //
        //                   Step 5                   //
        //                                            //
        //********************************************//

        let mut path = vec![(i, j)];
        loop {
            let (_, col) = path[path.len() - 1];
            let Some(row) = (0..n).find(|&r| stars[(r, col)]) else {
                break;
            };
            path.push((row, col));

            let Some(prime_col) = (0..n).find(|&c| primes[(row, c)]) else {
                break;
            };
            path.push((row, prime_col));
        }

        for (r, c) in path {
            stars[(r, c)] = primes[(r, c)];
        }

        row_cover.clear();
        col_cover.clear();
        primes.fill(false);

        verify = true;
    }
}

/// Converts a similarity in `[0, 1]` to an integer cost: `floor(100 * s)`.
pub fn similarity_cost(similarity: f32) -> i64 {
    (100. * similarity).floor() as i64
}

/// Builds a `max(rows, cols)` square matrix; cells outside `rows x cols` are
/// zero-cost dummies.
pub fn square_cost_matrix<F>(rows: usize, cols: usize, mut cost_fn: F) -> CostMatrix
where
    F: FnMut(usize, usize) -> i64,
{
    let n = rows.max(cols);

    na::DMatrix::from_fn(n, n, |r, c| {
        if r < rows && c < cols {
            cost_fn(r, c)
        } else {
            0
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    /// Accept `cost >= value`.
    AtLeast(i64),
    /// Accept `cost > value`.
    Above(i64),
}

impl Threshold {
    pub fn accepts(&self, cost: i64) -> bool {
        match *self {
            Threshold::AtLeast(v) => cost >= v,
            Threshold::Above(v) => cost > v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentKwargs {
    /// IoU stage between active tracks and detections.
    pub primary: Threshold,
    /// Appearance stage between suspended tracks and leftover detections.
    pub reacquire: Threshold,
}

impl Default for AssignmentKwargs {
    fn default() -> Self {
        Self {
            primary: Threshold::AtLeast(30),
            reacquire: Threshold::Above(20),
        }
    }
}

/// Outcome of one assignment stage, in terms of the real (unpadded) rows and
/// columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matching {
    pub accepted: Vec<Assignment>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Builds the padded cost matrix for `rows x cols`, solves it in one shot and
/// keeps the real pairs that pass `threshold`.
pub fn match_by_cost_matrix<S, F>(
    solver: &S,
    rows: usize,
    cols: usize,
    threshold: Threshold,
    cost_fn: F,
) -> Matching
where
    S: AssignmentSolver + ?Sized,
    F: FnMut(usize, usize) -> i64,
{
    if rows == 0 || cols == 0 {
        return Matching {
            accepted: Vec::new(),
            unmatched_rows: (0..rows).collect(),
            unmatched_cols: (0..cols).collect(),
        };
    }

    let cost = square_cost_matrix(rows, cols, cost_fn);
    let solved = solver.solve(&cost);
    trace!("solved {}x{} cost matrix: {:?}", cost.nrows(), cost.ncols(), solved);

    let mut row_taken = vec![false; rows];
    let mut col_taken = vec![false; cols];
    let mut accepted = Vec::new();

    for a in solved {
        if a.row < rows && a.col < cols && threshold.accepts(a.cost) {
            row_taken[a.row] = true;
            col_taken[a.col] = true;
            accepted.push(a);
        }
    }

    Matching {
        accepted,
        unmatched_rows: (0..rows).filter(|&r| !row_taken[r]).collect(),
        unmatched_cols: (0..cols).filter(|&c| !col_taken[c]).collect(),
    }
}
