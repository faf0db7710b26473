//! Built-in codecs.

pub mod bwct;
pub mod register_map;

use crate::error::{DeviceError, RegistryError, TransportError};
use crate::registry::CodecRegistry;

/// Register every built-in codec.
pub fn register_builtin(registry: &mut CodecRegistry) -> Result<(), RegistryError> {
    bwct::register(registry)?;
    register_map::register(registry)?;
    Ok(())
}

/// A registry holding the built-in codecs.
pub fn builtin_registry() -> Result<CodecRegistry, RegistryError> {
    let mut registry = CodecRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

/// Exactly `N` values of a block read.
pub(crate) fn fixed<T, const N: usize>(values: Vec<T>) -> Result<[T; N], DeviceError> {
    <[T; N]>::try_from(values).map_err(|values: Vec<T>| {
        TransportError::Malformed(format!("expected {} values, got {}", N, values.len())).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry().unwrap();
        assert!(registry.contains(bwct::VENDOR, bwct::SHTC3));
        assert!(registry.contains(register_map::VENDOR, register_map::PRODUCT));
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn test_fixed() {
        let [a, b]: [u16; 2] = fixed(vec![1, 2]).unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(fixed::<u16, 3>(vec![1, 2]).is_err());
    }
}
