//! Federated averaging: element-wise arithmetic mean of equal-shaped weight
//! tensor sets. Shape agreement is checked up front; mismatched submissions
//! are rejected rather than truncated.

use crate::job::TensorSet;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FedAvgError {
    #[error("no weight sets provided")]
    Empty,

    #[error("weight set {index} has {got} tensors, expected {expected}")]
    TensorCountMismatch {
        index: usize,
        got: usize,
        expected: usize,
    },

    #[error("tensor {tensor} in weight set {index} has length {got}, expected {expected}")]
    TensorLenMismatch {
        index: usize,
        tensor: usize,
        got: usize,
        expected: usize,
    },
}

pub fn fedavg(sets: &[TensorSet]) -> Result<TensorSet, FedAvgError> {
    let first = sets.first().ok_or(FedAvgError::Empty)?;

    for (index, set) in sets.iter().enumerate().skip(1) {
        if set.len() != first.len() {
            return Err(FedAvgError::TensorCountMismatch {
                index,
                got: set.len(),
                expected: first.len(),
            });
        }
        for (tensor, values) in set.iter().enumerate() {
            if values.len() != first[tensor].len() {
                return Err(FedAvgError::TensorLenMismatch {
                    index,
                    tensor,
                    got: values.len(),
                    expected: first[tensor].len(),
                });
            }
        }
    }

    let n = sets.len() as f32;
    let averaged = first
        .iter()
        .enumerate()
        .map(|(t, tensor)| {
            (0..tensor.len())
                .map(|j| sets.iter().map(|s| s[t][j]).sum::<f32>() / n)
                .collect()
        })
        .collect();

    Ok(averaged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f32 = 1e-6;

    fn assert_close(a: &TensorSet, b: &TensorSet) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.len(), y.len());
            for (u, v) in x.iter().zip(y) {
                assert!((u - v).abs() < TOL, "{u} != {v}");
            }
        }
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(fedavg(&[]), Err(FedAvgError::Empty));
    }

    #[test]
    fn averages_two_layer_sets() {
        let a = vec![vec![1.0; 128], vec![1.0; 10]];
        let b = vec![vec![3.0; 128], vec![3.0; 10]];
        let avg = fedavg(&[a, b]).unwrap();
        assert_close(&avg, &vec![vec![2.0; 128], vec![2.0; 10]]);
    }

    #[test]
    fn commutative() {
        let a = vec![vec![0.5, 1.5], vec![2.0]];
        let b = vec![vec![-0.5, 4.5], vec![6.0]];
        let ab = fedavg(&[a.clone(), b.clone()]).unwrap();
        let ba = fedavg(&[b, a]).unwrap();
        assert_close(&ab, &ba);
    }

    #[test]
    fn averaging_a_set_with_itself_is_identity() {
        let a = vec![vec![0.25, -1.0, 3.5], vec![9.0, 0.0]];
        let avg = fedavg(&[a.clone(), a.clone()]).unwrap();
        assert_close(&avg, &a);
    }

    #[test]
    fn rejects_tensor_count_mismatch() {
        let a = vec![vec![1.0], vec![2.0]];
        let b = vec![vec![1.0]];
        assert_eq!(
            fedavg(&[a, b]),
            Err(FedAvgError::TensorCountMismatch {
                index: 1,
                got: 1,
                expected: 2,
            })
        );
    }

    #[test]
    fn rejects_tensor_length_mismatch() {
        let a = vec![vec![1.0, 2.0]];
        let b = vec![vec![1.0, 2.0, 3.0]];
        assert_eq!(
            fedavg(&[a, b]),
            Err(FedAvgError::TensorLenMismatch {
                index: 1,
                tensor: 0,
                got: 3,
                expected: 2,
            })
        );
    }
}
