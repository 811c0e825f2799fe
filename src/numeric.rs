use ndarray::ArrayView2;
use num_traits::Float;
use std::fmt::Display;

/// Assert to float iterables are the same up to `eps`.
#[allow(dead_code)]
pub fn assert_float_eq<T>(left: T, right: T, eps: T)
where
    T: Float + Display,
{
    if left.is_nan() {
        assert!(right.is_nan(), "left is NaN, but right is not");
    } else {
        let diff = (left - right).abs();
        assert!(
            diff < eps,
            "values |{} - {}| ≥ {} (diff: {})",
            left,
            right,
            eps,
            diff
        );
    }
}

/// Assert to float values are the same up to `eps`.
#[allow(dead_code)]
pub fn assert_floats_eq<T>(left: &[T], right: &[T], eps: T)
where
    T: Float + Display,
{
    assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(right.iter()) {
        assert_float_eq(*l, *r, eps)
    }
}

/// Check that a matrix is square, symmetric up to `eps`, and has a zero diagonal.
pub fn is_symmetric_dissimilarity<T: Float>(matrix: ArrayView2<T>, eps: T) -> bool {
    let (nrows, ncols) = matrix.dim();
    if nrows != ncols {
        return false;
    }
    for i in 0..nrows {
        if matrix[[i, i]].abs() > eps {
            return false;
        }
        for j in (i + 1)..ncols {
            if (matrix[[i, j]] - matrix[[j, i]]).abs() > eps {
                return false;
            }
        }
    }
    true
}

/// The running total of `values`, starting at zero.
///
/// The output has one more element than the input.
pub fn cumulative_sum<T: Float>(values: &[T]) -> Vec<T> {
    std::iter::once(T::zero())
        .chain(values.iter().scan(T::zero(), |state, &x| {
            *state = *state + x;
            Some(*state)
        }))
        .collect()
}

// Haldane's mapping function
//
// Brings recombination fractions to map distances (Morgans)
pub fn haldane<T: Float>(rf: T) -> T {
    T::from(-0.5).unwrap() * (T::one() - T::from(2.0).unwrap() * rf).ln()
}

// Inverse Haldane's mapping function
//
// Brings map distances to recombination fractions
pub fn haldane_inverse<T: Float>(map_distance: T) -> T {
    T::from(0.5).unwrap() * (T::one() - (T::from(-2.0).unwrap() * map_distance).exp())
}

// Kosambi's mapping function, in Morgans
pub fn kosambi<T: Float>(rf: T) -> T {
    let two = T::from(2.0).unwrap();
    T::from(0.25).unwrap() * ((T::one() + two * rf) / (T::one() - two * rf)).ln()
}

#[allow(dead_code)]
pub fn kosambi_inverse<T: Float>(map_distance: T) -> T {
    T::from(0.5).unwrap() * (T::from(4.0).unwrap() * map_distance).tanh()
}
