use crate::error::{ZarrError, ZarrResult};
use crate::types::{ArrayOrder, DataType, ObjectValue};

// ---------------------------------------------------------------------------
// ObjectArray
// ---------------------------------------------------------------------------

/// An in-memory array of generic objects, stored row-major.
///
/// This is what the msgpack object codec consumes and produces: each element
/// is an arbitrary [`ObjectValue`], `dtype` records the declared element
/// type (usually `|O`, or a structured type with object fields).
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectArray {
    dtype: DataType,
    shape: Vec<usize>,
    elements: Vec<ObjectValue>,
}

impl ObjectArray {
    /// Build an array from row-major elements.
    pub fn new(dtype: DataType, shape: Vec<usize>, elements: Vec<ObjectValue>) -> ZarrResult<Self> {
        check_len(&shape, elements.len())?;
        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    /// Build an array from elements laid out in column-major (F) order.
    pub fn from_column_major(
        dtype: DataType,
        shape: Vec<usize>,
        elements: Vec<ObjectValue>,
    ) -> ZarrResult<Self> {
        check_len(&shape, elements.len())?;
        let f_strides = strides(&shape, ArrayOrder::F);
        let mut source = elements;
        let reordered = cartesian_indices(&shape)
            .iter()
            .map(|idx| {
                let flat: usize = idx.iter().zip(f_strides.iter()).map(|(i, s)| i * s).sum();
                std::mem::replace(&mut source[flat], ObjectValue::Nil)
            })
            .collect();
        Ok(Self {
            dtype,
            shape,
            elements: reordered,
        })
    }

    pub fn dtype(&self) -> &DataType {
        &self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Elements in row-major order.
    pub fn elements(&self) -> &[ObjectValue] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<ObjectValue> {
        self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element at the given multi-dimensional index, `None` if out of bounds.
    pub fn get(&self, indices: &[usize]) -> Option<&ObjectValue> {
        if indices.len() != self.shape.len()
            || indices.iter().zip(self.shape.iter()).any(|(i, d)| i >= d)
        {
            return None;
        }
        self.elements
            .get(linear_index(&self.shape, ArrayOrder::C, indices))
    }
}

fn check_len(shape: &[usize], len: usize) -> ZarrResult<()> {
    let expected = element_count(shape)
        .ok_or_else(|| ZarrError::Encode(format!("shape {shape:?} overflows usize")))?;
    if expected != len {
        return Err(ZarrError::Encode(format!(
            "shape {shape:?} holds {expected} elements, got {len}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Index math
// ---------------------------------------------------------------------------

/// Number of elements in `shape`, `None` if it does not fit in `usize`.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Calculate strides for an N-dimensional array.
pub fn strides(shape: &[usize], order: ArrayOrder) -> Vec<usize> {
    match order {
        ArrayOrder::C => {
            // Row-major: last dimension varies fastest.
            let mut s: Vec<usize> = shape
                .iter()
                .rev()
                .scan(1usize, |state, &dim| {
                    let stride = *state;
                    *state = state.saturating_mul(dim);
                    Some(stride)
                })
                .collect();
            s.reverse();
            s
        }
        ArrayOrder::F => {
            // Column-major: first dimension varies fastest.
            shape
                .iter()
                .scan(1usize, |state, &dim| {
                    let stride = *state;
                    *state = state.saturating_mul(dim);
                    Some(stride)
                })
                .collect()
        }
    }
}

/// Convert multi-dimensional indices to a flat linear index.
pub fn linear_index(shape: &[usize], order: ArrayOrder, indices: &[usize]) -> usize {
    let s = strides(shape, order);
    indices.iter().zip(s.iter()).map(|(i, s)| i * s).sum()
}

/// Generate all multi-dimensional index tuples within the given shape,
/// in row-major order.
pub fn cartesian_indices(shape: &[usize]) -> Vec<Vec<usize>> {
    if shape.is_empty() {
        return vec![vec![]];
    }
    let first = shape[0];
    let rest = cartesian_indices(&shape[1..]);
    let mut result = Vec::new();
    for i in 0..first {
        for r in &rest {
            let mut v = vec![i];
            v.extend_from_slice(r);
            result.push(v);
        }
    }
    result
}
