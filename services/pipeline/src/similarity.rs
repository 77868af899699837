//! Cosine similarity between entities over standardized feature vectors.
//!
//! Steps: z-score each numeric column (population standard deviation),
//! L2-normalize each entity row, then take R·Rᵗ.

use std::cmp::Ordering;
use std::io::Read;
use std::path::Path;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: String,
    pub data: ColumnData,
}

/// One row per entity: an identifier column plus named feature columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub id_column: String,
    pub ids: Vec<String>,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureTable {
    pub fn new(id_column: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            id_column: id_column.into(),
            ids,
            columns: Vec::new(),
        }
    }

    pub fn push_column(&mut self, name: impl Into<String>, data: ColumnData) -> Result<()> {
        let name = name.into();
        if data.len() != self.ids.len() {
            return Err(PipelineError::ShapeMismatch {
                column: name,
                expected: self.ids.len(),
                got: data.len(),
            });
        }
        self.columns.push(FeatureColumn { name, data });
        Ok(())
    }

    /// Numeric columns other than the identifier, in table order.
    pub fn numeric_columns(&self) -> Vec<(&str, &[f64])> {
        self.columns
            .iter()
            .filter(|c| c.name != self.id_column)
            .filter_map(|c| match &c.data {
                ColumnData::Numeric(values) => Some((c.name.as_str(), values.as_slice())),
                ColumnData::Text(_) => None,
            })
            .collect()
    }

    /// Parses a feature CSV. A column is numeric when every non-empty cell is a finite number;
    /// empty cells in numeric columns read as 0.
    pub fn from_csv_reader<R: Read>(reader: R, id_column: &str) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let id_idx = headers
            .iter()
            .position(|h| h == id_column)
            .ok_or_else(|| PipelineError::MissingColumn(id_column.to_string()))?;

        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in rdr.records() {
            let record = record?;
            for (idx, column) in cells.iter_mut().enumerate() {
                column.push(record.get(idx).unwrap_or("").to_string());
            }
        }

        let mut table = FeatureTable::new(id_column, cells[id_idx].clone());
        for (idx, (name, values)) in headers.into_iter().zip(cells).enumerate() {
            if idx == id_idx {
                continue;
            }
            let parsed: Option<Vec<f64>> = values
                .iter()
                .map(|v| {
                    if v.is_empty() {
                        Some(0.0)
                    } else {
                        v.parse::<f64>().ok().filter(|x| x.is_finite())
                    }
                })
                .collect();
            let data = match parsed {
                Some(numbers) => ColumnData::Numeric(numbers),
                None => ColumnData::Text(values),
            };
            table.push_column(name, data)?;
        }
        Ok(table)
    }

    pub fn from_csv_path(path: &Path, id_column: &str) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, id_column)
    }
}

/// Square, symmetric entity × entity matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    pub entities: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl SimilarityMatrix {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i][j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i]
    }

    pub fn index_of(&self, entity: &str) -> Option<usize> {
        self.entities.iter().position(|e| e == entity)
    }

    /// The `k` entities most similar to `entity`, excluding itself.
    /// Ties order by entity id; `None` if the entity is unknown.
    pub fn most_similar(&self, entity: &str, k: usize) -> Option<Vec<(String, f64)>> {
        let i = self.index_of(entity)?;
        let mut ranked: Vec<(String, f64)> = self
            .entities
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, name)| (name.clone(), self.values[i][j]))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        Some(ranked)
    }
}

/// Z-scores each column with the population standard deviation. Zero-variance columns become all zeros.
pub fn standardize_columns(columns: &[&[f64]]) -> Vec<Vec<f64>> {
    columns
        .iter()
        .map(|values| {
            let n = values.len() as f64;
            if values.is_empty() {
                return Vec::new();
            }
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();
            if std_dev == 0.0 || !std_dev.is_finite() {
                return vec![0.0; values.len()];
            }
            values.iter().map(|v| (v - mean) / std_dev).collect()
        })
        .collect()
}

/// Divides each row by its Euclidean norm; a zero norm is replaced by 1, leaving the row unchanged.
pub fn l2_normalize_rows(rows: &mut [Vec<f64>]) {
    for row in rows.iter_mut() {
        let norm = row.iter().map(|x| x * x).sum::<f64>().sqrt();
        let divisor = if norm == 0.0 { 1.0 } else { norm };
        for x in row.iter_mut() {
            *x /= divisor;
        }
    }
}

/// Pairwise cosine similarity of the entities in `table`.
///
/// Only the upper triangle is computed and then mirrored, so the result is exactly symmetric.
/// The diagonal is 1.0 for every entity, zero vectors included; off-diagonal values are
/// clamped to [-1, 1].
pub fn cosine_similarity_matrix(table: &FeatureTable) -> Result<SimilarityMatrix> {
    let numeric = table.numeric_columns();
    if numeric.is_empty() {
        return Err(PipelineError::NoFeatureColumns(table.id_column.clone()));
    }
    if table.ids.is_empty() {
        return Err(PipelineError::EmptyInput("similarity"));
    }

    let raw: Vec<&[f64]> = numeric.iter().map(|(_, values)| *values).collect();
    let standardized = standardize_columns(&raw);

    let n = table.ids.len();
    let mut rows: Vec<Vec<f64>> = (0..n)
        .map(|i| standardized.iter().map(|col| col[i]).collect())
        .collect();
    l2_normalize_rows(&mut rows);

    let mut values = vec![vec![0.0; n]; n];
    for i in 0..n {
        values[i][i] = 1.0;
        for j in (i + 1)..n {
            let dot: f64 = rows[i].iter().zip(&rows[j]).map(|(a, b)| a * b).sum();
            let sim = dot.clamp(-1.0, 1.0);
            values[i][j] = sim;
            values[j][i] = sim;
        }
    }

    Ok(SimilarityMatrix {
        entities: table.ids.clone(),
        values,
    })
}
