//! Codec registry: (vendor, product) to codec.
//!
//! Built once at startup and shared read-only between bus workers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::{DeviceError, RegistryError, UnknownReason};

/// Result of a registry lookup.
pub enum Lookup<'a> {
    Found(&'a Arc<dyn Codec>),
    UnknownVendor,
    UnknownProduct,
}

impl<'a> Lookup<'a> {
    /// Turn a miss into the per-device error.
    pub fn into_result(self, vendor: &str, product: &str) -> Result<&'a Arc<dyn Codec>, DeviceError> {
        let reason = match self {
            Lookup::Found(codec) => return Ok(codec),
            Lookup::UnknownVendor => UnknownReason::Vendor,
            Lookup::UnknownProduct => UnknownReason::Product,
        };
        Err(DeviceError::UnknownDevice {
            vendor: vendor.to_string(),
            product: product.to_string(),
            reason,
        })
    }
}

#[derive(Default)]
pub struct CodecRegistry {
    vendors: HashMap<String, HashMap<String, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` for a (vendor, product) pair.
    ///
    /// The same codec may serve several pairs. Registering a different
    /// codec for a pair that is already taken fails.
    pub fn register(
        &mut self,
        vendor: &str,
        product: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<(), RegistryError> {
        let products = self.vendors.entry(vendor.to_string()).or_default();

        if let Some(existing) = products.get(product) {
            if Arc::ptr_eq(existing, &codec) {
                return Ok(());
            }
            return Err(RegistryError::DuplicateCodec {
                vendor: vendor.to_string(),
                product: product.to_string(),
            });
        }

        products.insert(product.to_string(), codec);
        Ok(())
    }

    pub fn lookup(&self, vendor: &str, product: &str) -> Lookup<'_> {
        match self.vendors.get(vendor) {
            None => Lookup::UnknownVendor,
            Some(products) => match products.get(product) {
                Some(codec) => Lookup::Found(codec),
                None => Lookup::UnknownProduct,
            },
        }
    }

    pub fn contains(&self, vendor: &str, product: &str) -> bool {
        matches!(self.lookup(vendor, product), Lookup::Found(_))
    }

    /// Number of registered (vendor, product) pairs.
    pub fn len(&self) -> usize {
        self.vendors.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pairs: Vec<_> = self
            .vendors
            .iter()
            .flat_map(|(vendor, products)| {
                products
                    .iter()
                    .map(move |(product, codec)| (vendor.as_str(), product.as_str(), codec.name()))
            })
            .collect();
        pairs.sort();
        f.debug_struct("CodecRegistry").field("codecs", &pairs).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mbgate_framework::MessageChannel;

    use crate::codec::CodecContext;
    use crate::port::FieldBus;

    struct Noop(&'static str);

    #[async_trait]
    impl Codec for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn cycle(
            &self,
            _port: &mut dyn FieldBus,
            _channel: &mut dyn MessageChannel,
            _ctx: &mut CodecContext<'_>,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn test_lookup_distinguishes_misses() {
        let mut registry = CodecRegistry::new();
        registry
            .register("Acme", "Widget", Arc::new(Noop("widget")))
            .unwrap();

        assert!(matches!(registry.lookup("Acme", "Widget"), Lookup::Found(_)));
        assert!(matches!(registry.lookup("Acme", "Gizmo"), Lookup::UnknownProduct));
        assert!(matches!(registry.lookup("Other", "Widget"), Lookup::UnknownVendor));
    }

    #[test]
    fn test_aliasing_shares_one_codec() {
        let codec: Arc<dyn Codec> = Arc::new(Noop("rfid"));
        let mut registry = CodecRegistry::new();
        registry.register("Acme", "Reader A", codec.clone()).unwrap();
        registry.register("Acme", "Reader B", codec.clone()).unwrap();
        // Re-registering the same codec is harmless.
        registry.register("Acme", "Reader A", codec.clone()).unwrap();

        assert_eq!(registry.len(), 2);
        let (Lookup::Found(a), Lookup::Found(b)) = (
            registry.lookup("Acme", "Reader A"),
            registry.lookup("Acme", "Reader B"),
        ) else {
            panic!("both aliases should resolve");
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_duplicate_codec_rejected() {
        let mut registry = CodecRegistry::new();
        registry.register("Acme", "Widget", Arc::new(Noop("one"))).unwrap();

        let result = registry.register("Acme", "Widget", Arc::new(Noop("two")));
        assert_eq!(
            result,
            Err(RegistryError::DuplicateCodec {
                vendor: "Acme".to_string(),
                product: "Widget".to_string(),
            })
        );
        let Lookup::Found(codec) = registry.lookup("Acme", "Widget") else {
            panic!("original codec should stay registered");
        };
        assert_eq!(codec.name(), "one");
    }

    #[test]
    fn test_unknown_device_error() {
        let registry = CodecRegistry::new();
        let err = registry
            .lookup("Acme", "Widget")
            .into_result("Acme", "Widget")
            .err();
        assert!(matches!(
            err,
            Some(DeviceError::UnknownDevice {
                reason: UnknownReason::Vendor,
                ..
            })
        ));
    }
}
