/// BLE transport configuration
///
/// Identifies the SMP GATT endpoint and bounds every wait the transport
/// performs.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::transport::abstraction::TransportError;

/// SMP GATT service UUID: 8D53DC1D-1DB7-4CD3-868B-8A527460AA84
pub const SMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x8D53DC1D_1DB7_4CD3_868B_8A527460AA84);

/// SMP GATT characteristic UUID: DA2E7828-FBCE-4E01-AE9E-261174997C48
pub const SMP_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xDA2E7828_FBCE_4E01_AE9E_261174997C48);

/// Smallest usable write size (ATT MTU 23 minus the 3-byte opcode/handle)
pub const MIN_MTU: usize = 20;

/// Default bound on each connection stage
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 20_000;

/// Default bound on a single request/response exchange
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 30_000;

/// Default number of `send` calls allowed to wait in line
pub const DEFAULT_MAX_QUEUED_TRANSACTIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleTransportConfig {
    /// Management service to look for during service discovery
    pub service_uuid: Uuid,
    /// Management characteristic used for both writes and notifications
    pub characteristic_uuid: Uuid,
    /// Bound on each connection stage in milliseconds
    pub connection_timeout_ms: u64,
    /// Bound on a request/response exchange in milliseconds
    pub transaction_timeout_ms: u64,
    /// Override for the peripheral's maximum write length
    pub mtu: Option<usize>,
    /// Queue depth for concurrent `send` calls
    pub max_queued_transactions: usize,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            service_uuid: SMP_SERVICE_UUID,
            characteristic_uuid: SMP_CHARACTERISTIC_UUID,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            mtu: None,
            max_queued_transactions: DEFAULT_MAX_QUEUED_TRANSACTIONS,
        }
    }
}

impl BleTransportConfig {
    /// Set the connection stage timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the request/response timeout
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Force the write chunk size
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set the queue depth for concurrent senders
    pub fn with_max_queued_transactions(mut self, max: usize) -> Self {
        self.max_queued_transactions = max;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.connection_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "connection timeout must be non-zero".to_string(),
            ));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig(
                "transaction timeout must be non-zero".to_string(),
            ));
        }
        if let Some(mtu) = self.mtu {
            if mtu < MIN_MTU {
                return Err(TransportError::InvalidConfig(format!(
                    "MTU {} is below the minimum of {}",
                    mtu, MIN_MTU
                )));
            }
        }
        if self.max_queued_transactions == 0 {
            return Err(TransportError::InvalidConfig(
                "queue depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
