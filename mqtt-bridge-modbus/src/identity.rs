//! Device identity cache.
//!
//! Vendor, product and version are learned once per device and kept for the
//! lifetime of the bus worker. Fields only ever go from unset to set, so a
//! failing identification query never loses what an earlier one returned.

use mbgate_common::topic::{PRODUCT_FIELD, VENDOR_FIELD, VERSION_FIELD};

use crate::config::DeviceConfig;
use crate::error::TransportError;
use crate::port::FieldBus;

/// One identification object of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityField {
    Vendor,
    Product,
    Version,
}

impl IdentityField {
    pub const ALL: [IdentityField; 3] = [
        IdentityField::Vendor,
        IdentityField::Product,
        IdentityField::Version,
    ];

    /// Object id of the Read Device Identification request.
    pub fn object_id(&self) -> u8 {
        match self {
            IdentityField::Vendor => 0,
            IdentityField::Product => 1,
            IdentityField::Version => 2,
        }
    }

    /// Topic field the value is published on.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityField::Vendor => VENDOR_FIELD,
            IdentityField::Product => PRODUCT_FIELD,
            IdentityField::Version => VERSION_FIELD,
        }
    }
}

/// Cached identity of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    /// Set once the command topic has been subscribed.
    pub topic_announced: bool,
}

impl DeviceIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: IdentityField) -> Option<&str> {
        match field {
            IdentityField::Vendor => self.vendor.as_deref(),
            IdentityField::Product => self.product.as_deref(),
            IdentityField::Version => self.version.as_deref(),
        }
    }

    fn slot_mut(&mut self, field: IdentityField) -> &mut Option<String> {
        match field {
            IdentityField::Vendor => &mut self.vendor,
            IdentityField::Product => &mut self.product,
            IdentityField::Version => &mut self.version,
        }
    }

    /// Store `value` if the field is still unset. Empty strings mean "not
    /// known yet" and are ignored. Returns whether the field was filled.
    pub fn fill(&mut self, field: IdentityField, value: &str) -> bool {
        let slot = self.slot_mut(field);
        if slot.is_some() || value.is_empty() {
            return false;
        }
        *slot = Some(value.to_string());
        true
    }

    /// Vendor and product, once both are known.
    pub fn key(&self) -> Option<(&str, &str)> {
        Some((self.vendor.as_deref()?, self.product.as_deref()?))
    }

    pub fn is_identified(&self) -> bool {
        self.key().is_some()
    }

    /// Name of the identity part still needed to select a codec.
    pub fn missing(&self) -> Option<&'static str> {
        match (&self.vendor, &self.product) {
            (None, None) => Some("vendor and product"),
            (None, Some(_)) => Some("vendor"),
            (Some(_), None) => Some("product"),
            (Some(_), Some(_)) => None,
        }
    }

    /// Fill every unset field from the static configuration or, failing
    /// that, from the device itself.
    ///
    /// Fields are resolved independently in vendor, product, version order.
    /// A transport error stops resolution, but fields learned before it
    /// stay cached.
    pub async fn resolve(
        &mut self,
        config: &DeviceConfig,
        port: &mut dyn FieldBus,
    ) -> Result<(), TransportError> {
        for field in IdentityField::ALL {
            if self.get(field).is_some() {
                continue;
            }

            let configured = match field {
                IdentityField::Vendor => config.vendor.as_deref(),
                IdentityField::Product => config.product.as_deref(),
                IdentityField::Version => config.version.as_deref(),
            };

            match configured {
                Some(value) => {
                    self.fill(field, value);
                }
                None => {
                    let value = port.identify(config.address, field).await?;
                    if self.fill(field, &value) {
                        tracing::debug!(
                            address = config.address,
                            field = field.as_str(),
                            value = %value,
                            "Learned device identity"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
