//! Field-bus port: register and identification operations on one bus.
//!
//! [`FieldBus`] is what codecs and the bus worker talk to. [`ModbusPort`]
//! implements it with `tokio-modbus` over TCP or serial RTU. The connection
//! is opened lazily on the first request and dropped after any transport
//! failure, so the next request reconnects.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_modbus::ProtocolError;

use crate::config::{ConnectionConfig, Parity};
use crate::error::TransportError;
use crate::identity::IdentityField;

/// Function code of Encapsulated Interface Transport.
const READ_DEVICE_ID_FUNCTION: u8 = 0x2B;
/// MEI type of Read Device Identification.
const MEI_READ_DEVICE_ID: u8 = 0x0E;
/// Read device id code: one specific object.
const READ_INDIVIDUAL_OBJECT: u8 = 0x04;

/// Register level access to the devices of one bus.
///
/// Every operation addresses a single unit. Implementations must not
/// interleave requests; the caller owns the port exclusively.
#[async_trait]
pub trait FieldBus: Send {
    async fn read_discrete_inputs(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_coils(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn write_coil(&mut self, address: u8, index: u16, value: bool)
    -> Result<(), TransportError>;

    async fn read_input_registers(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_holding_registers(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_register(
        &mut self,
        address: u8,
        index: u16,
        value: u16,
    ) -> Result<(), TransportError>;

    /// Read one device identification string.
    async fn identify(&mut self, address: u8, field: IdentityField)
    -> Result<String, TransportError>;

    /// Read a single input register.
    async fn read_input_register(&mut self, address: u8, index: u16) -> Result<u16, TransportError> {
        let values = self.read_input_registers(address, index, 1).await?;
        values
            .first()
            .copied()
            .ok_or_else(|| TransportError::Malformed("empty register response".to_string()))
    }
}

/// `tokio-modbus` backed port.
pub struct ModbusPort {
    connection: ConnectionConfig,
    timeout: Duration,
    ignore_sequence: bool,
    context: Option<Context>,
}

impl ModbusPort {
    pub fn new(connection: ConnectionConfig, timeout: Duration, ignore_sequence: bool) -> Self {
        Self {
            connection,
            timeout,
            ignore_sequence,
            context: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    /// Send a request, retrying once on a fresh connection after a sequence
    /// mismatch when `ignore_sequence` is configured.
    async fn request(
        &mut self,
        address: u8,
        request: Request<'static>,
    ) -> Result<Response, TransportError> {
        match self.try_request(address, request.clone()).await {
            Err(TransportError::SequenceMismatch(message)) if self.ignore_sequence => {
                tracing::debug!(
                    connection = %self.connection,
                    address,
                    message = %message,
                    "Ignoring sequence mismatch, retrying"
                );
                self.try_request(address, request).await
            }
            other => other,
        }
    }

    async fn try_request(
        &mut self,
        address: u8,
        request: Request<'static>,
    ) -> Result<Response, TransportError> {
        if self.context.is_none() {
            let context = connect(&self.connection, self.timeout).await?;
            tracing::debug!(connection = %self.connection, "Connected to field bus");
            self.context = Some(context);
        }

        let Some(context) = self.context.as_mut() else {
            return Err(TransportError::NotConnected(self.connection.to_string()));
        };

        context.set_slave(Slave(address));
        let outcome = match tokio::time::timeout(self.timeout, context.call(request)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => Err(transport_error(e)),
            Ok(Ok(Err(code))) => Err(TransportError::Exception(format!("{:?}", code))),
            Ok(Ok(Ok(response))) => Ok(response),
        };

        if let Err(e) = &outcome {
            if e.drops_connection() {
                tracing::debug!(connection = %self.connection, error = %e, "Dropping connection");
                self.context = None;
            }
        }

        outcome
    }
}

#[async_trait]
impl FieldBus for ModbusPort {
    async fn read_discrete_inputs(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        match self
            .request(address, Request::ReadDiscreteInputs(start, count))
            .await?
        {
            Response::ReadDiscreteInputs(bits) => exact(bits, count),
            other => Err(unexpected(&other)),
        }
    }

    async fn read_coils(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        match self.request(address, Request::ReadCoils(start, count)).await? {
            Response::ReadCoils(bits) => exact(bits, count),
            other => Err(unexpected(&other)),
        }
    }

    async fn write_coil(
        &mut self,
        address: u8,
        index: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        match self
            .request(address, Request::WriteSingleCoil(index, value))
            .await?
        {
            Response::WriteSingleCoil(..) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn read_input_registers(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        match self
            .request(address, Request::ReadInputRegisters(start, count))
            .await?
        {
            Response::ReadInputRegisters(words) => exact(words, count),
            other => Err(unexpected(&other)),
        }
    }

    async fn read_holding_registers(
        &mut self,
        address: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        match self
            .request(address, Request::ReadHoldingRegisters(start, count))
            .await?
        {
            Response::ReadHoldingRegisters(words) => exact(words, count),
            other => Err(unexpected(&other)),
        }
    }

    async fn write_register(
        &mut self,
        address: u8,
        index: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        match self
            .request(address, Request::WriteSingleRegister(index, value))
            .await?
        {
            Response::WriteSingleRegister(..) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn identify(
        &mut self,
        address: u8,
        field: IdentityField,
    ) -> Result<String, TransportError> {
        let object_id = field.object_id();
        let request = Request::Custom(
            READ_DEVICE_ID_FUNCTION,
            Cow::Owned(vec![MEI_READ_DEVICE_ID, READ_INDIVIDUAL_OBJECT, object_id]),
        );

        match self.request(address, request).await? {
            Response::Custom(function, data) if function == READ_DEVICE_ID_FUNCTION => {
                parse_device_identification(&data, object_id)
            }
            other => Err(unexpected(&other)),
        }
    }
}

/// Open a client context for the configured transport.
async fn connect(
    connection: &ConnectionConfig,
    timeout: Duration,
) -> Result<Context, TransportError> {
    match connection {
        ConnectionConfig::Tcp { host, port } => {
            let addr = tokio::time::timeout(timeout, tokio::net::lookup_host((host.as_str(), *port)))
                .await
                .map_err(|_| TransportError::Timeout)??
                .next()
                .ok_or_else(|| {
                    TransportError::NotConnected(format!("{}:{} did not resolve", host, port))
                })?;

            let context = tokio::time::timeout(timeout, tcp::connect(addr))
                .await
                .map_err(|_| TransportError::Timeout)??;

            Ok(context)
        }
        ConnectionConfig::Rtu {
            path,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let parity = match parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            };

            let stop_bits = match stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            };

            let data_bits = match data_bits {
                5 => tokio_serial::DataBits::Five,
                6 => tokio_serial::DataBits::Six,
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            };

            let builder = tokio_serial::new(path, *baud_rate)
                .parity(parity)
                .stop_bits(stop_bits)
                .data_bits(data_bits);

            let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                TransportError::NotConnected(format!("Serial open of {} failed: {}", path, e))
            })?;

            Ok(rtu::attach(serial))
        }
    }
}

fn transport_error(err: tokio_modbus::Error) -> TransportError {
    match err {
        tokio_modbus::Error::Transport(e) => e.into(),
        tokio_modbus::Error::Protocol(ProtocolError::HeaderMismatch { message, .. }) => {
            TransportError::SequenceMismatch(message)
        }
        tokio_modbus::Error::Protocol(other) => TransportError::Malformed(other.to_string()),
    }
}

fn unexpected(response: &Response) -> TransportError {
    TransportError::Malformed(format!("unexpected response {:?}", response))
}

/// Bit responses are padded to whole bytes; cut them to the requested count.
fn exact<T>(mut values: Vec<T>, count: u16) -> Result<Vec<T>, TransportError> {
    let count = usize::from(count);
    if values.len() < count {
        return Err(TransportError::Malformed(format!(
            "expected {} values, got {}",
            count,
            values.len()
        )));
    }
    values.truncate(count);
    Ok(values)
}

/// Extract object `object_id` from a Read Device Identification response
/// payload (the bytes after the function code).
///
/// Layout: MEI type, read code, conformity level, more follows, next object
/// id, object count, then `count` times `[id, length, bytes...]`. A missing
/// object yields an empty string.
pub fn parse_device_identification(payload: &[u8], object_id: u8) -> Result<String, TransportError> {
    if payload.len() < 6 {
        return Err(TransportError::Malformed(
            "device identification payload too short".to_string(),
        ));
    }
    if payload[0] != MEI_READ_DEVICE_ID {
        return Err(TransportError::Malformed(format!(
            "device identification MEI type 0x{:02x}",
            payload[0]
        )));
    }

    let object_count = usize::from(payload[5]);
    let mut cursor = 6usize;
    for _ in 0..object_count {
        let header = payload.get(cursor..cursor + 2).ok_or_else(|| {
            TransportError::Malformed("device identification object header truncated".to_string())
        })?;
        let (id, len) = (header[0], usize::from(header[1]));
        cursor += 2;

        let value = payload.get(cursor..cursor + len).ok_or_else(|| {
            TransportError::Malformed("device identification object data truncated".to_string())
        })?;
        cursor += len;

        if id == object_id {
            return Ok(String::from_utf8_lossy(value).trim_end_matches('\0').to_string());
        }
    }

    Ok(String::new())
}
