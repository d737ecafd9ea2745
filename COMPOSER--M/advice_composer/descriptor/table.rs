use serde::{Deserialize, Serialize};

use crate::error::{ComposerError, ComposerResult};

/// Gridded lookup table over strictly increasing axes.
pub trait LookupTable: Sized {
    /// Axes in declared order.
    fn axes(&self) -> &[Vec<f64>];

    /// Interpolated value at `point` (one coordinate per axis). `None` outside
    /// the domain or when an involved grid value is unset.
    fn interpolate(&self, point: &[f64]) -> Option<f64>;

    /// Builds a table from axes and row-major grid values.
    fn from_grid(axes: Vec<Vec<f64>>, values: Vec<Option<f64>>) -> ComposerResult<Self>;
}

fn validate_grid(axes: &[Vec<f64>], values: &[Option<f64>]) -> ComposerResult<()> {
    for (index, axis) in axes.iter().enumerate() {
        if axis.is_empty() {
            return Err(ComposerError::Decode(format!("axis {index} is empty")));
        }
        if axis.iter().any(|c| !c.is_finite()) {
            return Err(ComposerError::Decode(format!("axis {index} is not finite")));
        }
        if axis.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ComposerError::Decode(format!(
                "axis {index} is not strictly increasing"
            )));
        }
    }
    let expected: usize = axes.iter().map(Vec::len).product();
    if values.len() != expected {
        return Err(ComposerError::Decode(format!(
            "grid holds {} values, axes require {expected}",
            values.len()
        )));
    }
    Ok(())
}

/// Position of `x` on an axis: `(lower, upper, fraction)`. Grid nodes give `lower == upper`.
fn bracket(axis: &[f64], x: f64) -> Option<(usize, usize, f64)> {
    match axis.binary_search_by(|c| c.total_cmp(&x)) {
        Ok(index) => Some((index, index, 0.0)),
        Err(0) => None,
        Err(index) if index >= axis.len() => None,
        Err(index) => {
            let (lo, hi) = (axis[index - 1], axis[index]);
            Some((index - 1, index, (x - lo) / (hi - lo)))
        }
    }
}

fn lerp(a: Option<f64>, b: Option<f64>, t: f64, same: bool) -> Option<f64> {
    if same {
        return a;
    }
    let (a, b) = (a?, b?);
    Some((b - a).mul_add(t, a))
}

/// One-dimensional table with linear interpolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Table1DWire", into = "Table1DWire")]
pub struct Table1D {
    axes: [Vec<f64>; 1],
    values: Vec<Option<f64>>,
}

#[derive(Serialize, Deserialize)]
struct Table1DWire {
    axis: Vec<f64>,
    values: Vec<Option<f64>>,
}

impl TryFrom<Table1DWire> for Table1D {
    type Error = ComposerError;

    fn try_from(wire: Table1DWire) -> Result<Self, Self::Error> {
        Self::new(wire.axis, wire.values)
    }
}

impl From<Table1D> for Table1DWire {
    fn from(table: Table1D) -> Self {
        let [axis] = table.axes;
        Self {
            axis,
            values: table.values,
        }
    }
}

impl Table1D {
    /// Validated table.
    pub fn new(axis: Vec<f64>, values: Vec<Option<f64>>) -> ComposerResult<Self> {
        let axes = [axis];
        validate_grid(&axes, &values)?;
        Ok(Self { axes, values })
    }

    /// Grid values.
    #[must_use]
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }
}

impl LookupTable for Table1D {
    fn axes(&self) -> &[Vec<f64>] {
        &self.axes
    }

    fn interpolate(&self, point: &[f64]) -> Option<f64> {
        let [x] = point else {
            return None;
        };
        let (lo, hi, t) = bracket(&self.axes[0], *x)?;
        lerp(self.values[lo], self.values[hi], t, lo == hi)
    }

    fn from_grid(axes: Vec<Vec<f64>>, values: Vec<Option<f64>>) -> ComposerResult<Self> {
        let Ok([axis]) = <[Vec<f64>; 1]>::try_from(axes) else {
            return Err(ComposerError::Decode("1-D table needs one axis".into()));
        };
        Self::new(axis, values)
    }
}

/// Two-dimensional table with bilinear interpolation. Values are row-major:
/// the second axis varies fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Table2DWire", into = "Table2DWire")]
pub struct Table2D {
    axes: [Vec<f64>; 2],
    values: Vec<Option<f64>>,
}

#[derive(Serialize, Deserialize)]
struct Table2DWire {
    rows: Vec<f64>,
    columns: Vec<f64>,
    values: Vec<Option<f64>>,
}

impl TryFrom<Table2DWire> for Table2D {
    type Error = ComposerError;

    fn try_from(wire: Table2DWire) -> Result<Self, Self::Error> {
        Self::new(wire.rows, wire.columns, wire.values)
    }
}

impl From<Table2D> for Table2DWire {
    fn from(table: Table2D) -> Self {
        let [rows, columns] = table.axes;
        Self {
            rows,
            columns,
            values: table.values,
        }
    }
}

impl Table2D {
    /// Validated table.
    pub fn new(
        rows: Vec<f64>,
        columns: Vec<f64>,
        values: Vec<Option<f64>>,
    ) -> ComposerResult<Self> {
        let axes = [rows, columns];
        validate_grid(&axes, &values)?;
        Ok(Self { axes, values })
    }

    /// Grid value at `(row, column)`.
    #[must_use]
    pub fn value(&self, row: usize, column: usize) -> Option<f64> {
        let width = self.axes[1].len();
        if column >= width {
            return None;
        }
        self.values.get(row * width + column).copied().flatten()
    }
}

impl LookupTable for Table2D {
    fn axes(&self) -> &[Vec<f64>] {
        &self.axes
    }

    fn interpolate(&self, point: &[f64]) -> Option<f64> {
        let [x, y] = point else {
            return None;
        };
        let (i0, i1, tx) = bracket(&self.axes[0], *x)?;
        let (j0, j1, ty) = bracket(&self.axes[1], *y)?;
        let low = lerp(self.value(i0, j0), self.value(i0, j1), ty, j0 == j1);
        let high = lerp(self.value(i1, j0), self.value(i1, j1), ty, j0 == j1);
        lerp(low, high, tx, i0 == i1)
    }

    fn from_grid(axes: Vec<Vec<f64>>, values: Vec<Option<f64>>) -> ComposerResult<Self> {
        let Ok([rows, columns]) = <[Vec<f64>; 2]>::try_from(axes) else {
            return Err(ComposerError::Decode("2-D table needs two axes".into()));
        };
        Self::new(rows, columns, values)
    }
}
