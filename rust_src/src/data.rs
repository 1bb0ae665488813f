//! Response data and its tabulation into unique response patterns.

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1};

use crate::error::{MirtError, MirtResult};

/// Marker for an unobserved response. Any negative entry is treated as missing.
pub const MISSING: i32 = -1;

/// Immutable N×J response matrix with categories recoded to `0..K_j-1`.
#[derive(Debug, Clone)]
pub struct ResponseMatrix {
    data: Array2<i32>,
    groups: Vec<usize>,
    n_groups: usize,
    categories: Vec<Vec<i32>>,
}

impl ResponseMatrix {
    pub fn new(data: Array2<i32>) -> MirtResult<Self> {
        let n = data.nrows();
        Self::with_groups(data, vec![0; n])
    }

    /// Responses with a group label per row; labels must be `0..G-1`.
    pub fn with_groups(data: Array2<i32>, groups: Vec<usize>) -> MirtResult<Self> {
        let (n, n_items) = data.dim();
        if n == 0 || n_items == 0 {
            return Err(MirtError::Input("response matrix is empty".into()));
        }
        if groups.len() != n {
            return Err(MirtError::Input(format!(
                "group vector has {} entries for {} respondents",
                groups.len(),
                n
            )));
        }
        let n_groups = groups.iter().copied().max().unwrap_or(0) + 1;
        for g in 0..n_groups {
            if !groups.contains(&g) {
                return Err(MirtError::Input(format!("group {} has no respondents", g)));
            }
        }

        let mut categories = Vec::with_capacity(n_items);
        for j in 0..n_items {
            let mut values: Vec<i32> = data.column(j).iter().copied().filter(|&r| r >= 0).collect();
            values.sort_unstable();
            values.dedup();
            if values.len() < 2 {
                return Err(MirtError::Input(format!(
                    "item {} has fewer than 2 observed categories",
                    j
                )));
            }
            categories.push(values);
        }

        let mut recoded = Array2::from_elem((n, n_items), MISSING);
        for ((i, j), &r) in data.indexed_iter() {
            if r >= 0 {
                // values are sorted, the search always succeeds
                if let Ok(k) = categories[j].binary_search(&r) {
                    recoded[[i, j]] = k as i32;
                }
            }
        }

        Ok(ResponseMatrix {
            data: recoded,
            groups,
            n_groups,
            categories,
        })
    }

    /// Build from floating point input; NaN is missing, any other non-integer is rejected.
    pub fn from_f64(data: &Array2<f64>) -> MirtResult<Self> {
        let mut out = Array2::from_elem(data.dim(), MISSING);
        for ((i, j), &x) in data.indexed_iter() {
            if x.is_nan() {
                continue;
            }
            if x.fract() != 0.0 || !x.is_finite() || x.abs() > i32::MAX as f64 {
                return Err(MirtError::Input(format!(
                    "response [{}, {}] = {} is not an integer category",
                    i, j, x
                )));
            }
            out[[i, j]] = x as i32;
        }
        Self::new(out)
    }

    pub fn n_persons(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.data.ncols()
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    /// Recoded responses, missing entries negative
    pub fn data(&self) -> &Array2<i32> {
        &self.data
    }

    pub fn groups(&self) -> &[usize] {
        &self.groups
    }

    pub fn n_categories(&self) -> Vec<usize> {
        self.categories.iter().map(|c| c.len()).collect()
    }

    /// Original category codes per item
    pub fn category_values(&self) -> &[Vec<i32>] {
        &self.categories
    }

    pub fn has_missing(&self) -> bool {
        self.data.iter().any(|&r| r < 0)
    }

    /// Recode rows given in original category codes.
    pub fn recode(&self, patterns: &Array2<i32>) -> MirtResult<Array2<i32>> {
        recode_with(&self.categories, patterns)
    }
}

pub(crate) fn recode_with(
    categories: &[Vec<i32>],
    patterns: &Array2<i32>,
) -> MirtResult<Array2<i32>> {
    if patterns.ncols() != categories.len() {
        return Err(MirtError::Input(format!(
            "pattern has {} columns but the model has {} items",
            patterns.ncols(),
            categories.len()
        )));
    }
    let mut out = Array2::from_elem(patterns.dim(), MISSING);
    for ((i, j), &r) in patterns.indexed_iter() {
        if r < 0 {
            continue;
        }
        match categories[j].binary_search(&r) {
            Ok(k) => out[[i, j]] = k as i32,
            Err(_) => {
                return Err(MirtError::Input(format!(
                    "category {} was not observed for item {}",
                    r, j
                )))
            }
        }
    }
    Ok(out)
}

/// Unique (group, response row) patterns with frequencies; frequencies sum to N.
#[derive(Debug, Clone)]
pub struct PatternTable {
    pub patterns: Array2<i32>,
    pub freq: Vec<f64>,
    pub group: Vec<usize>,
    /// Pattern index for each respondent row
    pub row_pattern: Vec<usize>,
    pub n_groups: usize,
}

impl PatternTable {
    pub fn from_responses(data: &ResponseMatrix) -> Self {
        Self::tabulate(data.data(), data.groups(), data.n_groups())
    }

    pub fn tabulate(data: &Array2<i32>, groups: &[usize], n_groups: usize) -> Self {
        let n_items = data.ncols();
        let mut index: HashMap<(usize, Vec<i32>), usize> = HashMap::new();
        let mut rows: Vec<Vec<i32>> = Vec::new();
        let mut freq: Vec<f64> = Vec::new();
        let mut group: Vec<usize> = Vec::new();
        let mut row_pattern = Vec::with_capacity(data.nrows());

        for (i, row) in data.rows().into_iter().enumerate() {
            let key: Vec<i32> = row.iter().map(|&r| if r < 0 { MISSING } else { r }).collect();
            let g = groups[i];
            let next = rows.len();
            let idx = *index.entry((g, key.clone())).or_insert(next);
            if idx == next {
                rows.push(key);
                freq.push(0.0);
                group.push(g);
            }
            freq[idx] += 1.0;
            row_pattern.push(idx);
        }

        let mut patterns = Array2::from_elem((rows.len(), n_items), MISSING);
        for (p, row) in rows.iter().enumerate() {
            for (j, &r) in row.iter().enumerate() {
                patterns[[p, j]] = r;
            }
        }

        PatternTable {
            patterns,
            freq,
            group,
            row_pattern,
            n_groups,
        }
    }

    pub fn n_patterns(&self) -> usize {
        self.freq.len()
    }

    pub fn pattern(&self, p: usize) -> ArrayView1<'_, i32> {
        self.patterns.row(p)
    }

    /// Pattern indices belonging to group `g`
    pub fn group_patterns(&self, g: usize) -> Vec<usize> {
        (0..self.n_patterns()).filter(|&p| self.group[p] == g).collect()
    }

    pub fn total(&self) -> f64 {
        self.freq.iter().sum()
    }

    pub fn group_total(&self, g: usize) -> f64 {
        self.group_patterns(g).iter().map(|&p| self.freq[p]).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn recodes_categories_to_zero_based() {
        let data = ResponseMatrix::new(array![[1, 3], [2, 5], [1, -1], [2, 3]]).unwrap();
        assert_eq!(data.n_categories(), vec![2, 2]);
        assert_eq!(data.data()[[1, 1]], 1);
        assert_eq!(data.data()[[2, 1]], MISSING);
        assert!(data.has_missing());
        let custom = data.recode(&array![[2, 5]]).unwrap();
        assert_eq!(custom, array![[1, 1]]);
        assert!(data.recode(&array![[4, 5]]).is_err());
    }

    #[test]
    fn rejects_constant_items_and_bad_groups() {
        assert!(ResponseMatrix::new(array![[1, 0], [1, 1]]).is_err());
        assert!(ResponseMatrix::with_groups(array![[1, 0], [0, 1]], vec![0]).is_err());
        assert!(ResponseMatrix::with_groups(array![[1, 0], [0, 1]], vec![0, 2]).is_err());
    }

    #[test]
    fn rejects_fractional_values() {
        assert!(ResponseMatrix::from_f64(&array![[0.0, 1.5], [1.0, 0.0]]).is_err());
        let ok =
            ResponseMatrix::from_f64(&array![[0.0, f64::NAN], [1.0, 0.0], [0.0, 1.0]]).unwrap();
        assert!(ok.has_missing());
    }

    #[test]
    fn pattern_frequencies_sum_to_n() {
        let data = ResponseMatrix::with_groups(
            array![[0, 1], [0, 1], [1, 1], [0, 1], [1, 0]],
            vec![0, 0, 0, 1, 1],
        )
        .unwrap();
        let table = PatternTable::from_responses(&data);
        assert_eq!(table.total(), 5.0);
        // the same row in two groups is two patterns
        assert_eq!(table.n_patterns(), 4);
        assert_eq!(table.freq[table.row_pattern[0]], 2.0);
        assert_eq!(table.group_total(1), 2.0);
    }
}
