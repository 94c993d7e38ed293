//! Core tensor types and fundamental operations

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::error::{TandemError, TandemResult};
use super::devices::Device;
use super::ops as kernels;

/// Compile-time rank with const generics for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape<const DIMS: usize> {
    pub dims: [usize; DIMS],
}

impl<const DIMS: usize> Shape<DIMS> {
    pub fn new(dims: [usize; DIMS]) -> Self {
        Self { dims }
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_valid(&self) -> bool {
        self.dims.iter().all(|&d| d > 0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }
}

impl Shape<2> {
    pub fn rows(&self) -> usize { self.dims[0] }
    pub fn cols(&self) -> usize { self.dims[1] }
}

impl<const DIMS: usize> Display for Shape<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

/// Dense row-major `f32` tensor.
///
/// The buffer is shared behind an `Arc`, so cloning a tensor (and saving it
/// for a backward pass) never copies data. Tensors are immutable once built.
#[derive(Clone, PartialEq)]
pub struct Tensor<const DIMS: usize> {
    data: Arc<Vec<f32>>,
    shape: Shape<DIMS>,
    device: Device,
}

impl<const DIMS: usize> Tensor<DIMS> {
    /// Create from a flat row-major buffer on the CPU
    pub fn from_vec(data: Vec<f32>, shape: Shape<DIMS>) -> TandemResult<Self> {
        Self::from_vec_on(data, shape, Device::Cpu)
    }

    /// Create from a flat row-major buffer on the given device
    pub fn from_vec_on(data: Vec<f32>, shape: Shape<DIMS>, device: Device) -> TandemResult<Self> {
        if data.len() != shape.total_elements() {
            return Err(TandemError::shape_error(
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self {
            data: Arc::new(data),
            shape,
            device,
        })
    }

    pub fn full(shape: Shape<DIMS>, value: f32, device: Device) -> Self {
        Self {
            data: Arc::new(vec![value; shape.total_elements()]),
            shape,
            device,
        }
    }

    pub fn zeros(shape: Shape<DIMS>, device: Device) -> Self {
        Self::full(shape, 0.0, device)
    }

    /// Get tensor shape
    pub fn shape(&self) -> Shape<DIMS> {
        self.shape
    }

    /// Get tensor device
    pub fn device(&self) -> Device {
        self.device
    }

    /// Get number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.as_ref().clone()
    }

    /// Same buffer under a new tag; placement is metadata only
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            data: Arc::clone(&self.data),
            shape: self.shape,
            device,
        }
    }

    /// Reinterpret the buffer under another shape with the same element count
    pub fn reshape<const NEW_DIMS: usize>(&self, shape: Shape<NEW_DIMS>) -> TandemResult<Tensor<NEW_DIMS>> {
        if shape.total_elements() != self.numel() {
            return Err(TandemError::shape_error(
                &format!("{} elements", self.numel()),
                &format!("shape {} with {} elements", shape, shape.total_elements()),
                Some("reshape must preserve the number of elements"),
            ));
        }
        Ok(Tensor {
            data: Arc::clone(&self.data),
            shape,
            device: self.device,
        })
    }

    /// Element-wise map into a new tensor with the same shape and device
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: Arc::new(self.data.iter().map(|&v| f(v)).collect()),
            shape: self.shape,
            device: self.device,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Maximum absolute element-wise difference, `None` on shape mismatch
    pub fn max_abs_diff(&self, other: &Self) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(self.data.iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }
}

impl Tensor<0> {
    pub fn scalar(value: f32) -> Self {
        Self::full(Shape::new([]), value, Device::Cpu)
    }

    pub fn item(&self) -> f32 {
        self.data[0]
    }
}

impl Tensor<2> {
    /// Build a matrix from equally long rows
    pub fn from_rows(rows: &[Vec<f32>]) -> TandemResult<Self> {
        let cols = rows.first().map_or(0, |r| r.len());
        if let Some(bad) = rows.iter().position(|r| r.len() != cols) {
            return Err(TandemError::shape_error(
                &format!("rows of length {}", cols),
                &format!("row {} of length {}", bad, rows[bad].len()),
                None,
            ));
        }
        Self::from_vec(rows.concat(), Shape::new([rows.len(), cols]))
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.shape.cols() + col]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let cols = self.shape.cols();
        &self.data[row * cols..(row + 1) * cols]
    }

    pub fn transpose(&self) -> Self {
        let [rows, cols] = self.shape.dims;
        Self {
            data: Arc::new(kernels::transpose(&self.data, rows, cols)),
            shape: Shape::new([cols, rows]),
            device: self.device,
        }
    }

    pub fn matmul(&self, other: &Self) -> TandemResult<Self> {
        let [m, k] = self.shape.dims;
        let [k2, n] = other.shape.dims;
        if k != k2 {
            return Err(TandemError::shape_error(
                &format!("inner dimension {}", k),
                &format!("{} @ {}", self.shape, other.shape),
                None,
            ));
        }
        self.device.ensure_same(&other.device, "matmul")?;
        Ok(Self {
            data: Arc::new(kernels::matmul(&self.data, &other.data, m, k, n)),
            shape: Shape::new([m, n]),
            device: self.device,
        })
    }
}

impl<const DIMS: usize> Debug for Tensor<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_creation() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.total_elements(), 24);
        assert!(shape.is_valid());
        assert!(!Shape::new([2, 0]).is_valid());
        assert_eq!(Shape::<0>::new([]).total_elements(), 1);
        assert_eq!(Shape::new([2, 3]).to_string(), "[2, 3]");
    }

    #[test]
    fn test_tensor_creation() {
        let tensor = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new([2, 2])).unwrap();
        assert_eq!(tensor.numel(), 4);
        assert_eq!(tensor.device(), Device::Cpu);
        assert_eq!(tensor.get(1, 0), 3.0);
        assert_eq!(tensor.row(1), &[3.0, 4.0]);

        let err = Tensor::from_vec(vec![1.0; 3], Shape::new([2, 2])).unwrap_err();
        assert!(matches!(err, TandemError::ShapeError(_)));
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let ok = Tensor::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert_eq!(ok.shape().dims, [2, 2]);
        assert!(Tensor::from_rows(&[vec![1.0, 0.0], vec![0.0]]).is_err());
    }

    #[test]
    fn test_reshape_shares_buffer() {
        let tensor = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new([2, 3])).unwrap();
        let flat = tensor.reshape(Shape::new([6])).unwrap();
        assert_eq!(flat.as_slice(), tensor.as_slice());
        assert!(tensor.reshape(Shape::new([4])).is_err());
    }

    #[test]
    fn test_matmul_and_transpose() {
        let a = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let gram = a.transpose().matmul(&a).unwrap();
        assert_eq!(gram.as_slice(), &[10.0, 14.0, 14.0, 20.0]);

        let b = Tensor::<2>::zeros(Shape::new([3, 1]), Device::Cpu);
        assert!(a.matmul(&b).is_err());
        let c = a.to_device(Device::Cuda(0));
        assert!(matches!(a.matmul(&c), Err(TandemError::DeviceError(_))));
    }

    #[test]
    fn test_scalar() {
        let s = Tensor::scalar(2.5);
        assert_eq!(s.item(), 2.5);
        assert!(s.is_finite());
        assert!(!Tensor::scalar(f32::NAN).is_finite());
    }
}
