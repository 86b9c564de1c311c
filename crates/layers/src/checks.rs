//! Shape and dtype assertions shared by the layer constructors and forward
//! paths. They return `candle_core::Result<()>` so call sites propagate with
//! `?` instead of panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has the given rank.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures the trailing (feature) axis has the expected width.
pub fn expect_last_dim(label: &str, tensor: &Tensor, width: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&actual) if actual == width => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected trailing dim {width}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Floating point dtypes accepted for parameters.
pub const PARAMETER_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn reports_label_on_mismatch() {
        let tensor = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = expect_shape("proj.weight", &tensor, &[3, 2]).unwrap_err();
        assert!(err.to_string().contains("proj.weight"));
        assert!(expect_last_dim("x", &tensor, 3).is_ok());
        assert!(expect_rank("x", &tensor, 3).is_err());
        assert!(expect_dtype_in("x", &tensor, &[DType::F16]).is_err());
    }
}
