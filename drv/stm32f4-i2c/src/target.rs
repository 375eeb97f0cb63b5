// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The child-device side of the emulated bus.

/// A device attached to the controller at a 7-bit address.
///
/// The controller batches traffic: a write transaction arrives as one or
/// more `write` calls followed by `finish_transmission`, and a read
/// transaction pulls batches with `read` -- eagerly when the data phase
/// begins, and again whenever the controller's receive queue drains. A
/// device that wants to stream can therefore return one byte per `read`
/// call; returning an empty batch is allowed and simply leaves RxNE low.
///
/// Any `Err` aborts the transaction in progress: the controller logs it,
/// returns to idle and raises the acknowledge-failure flag, which is all
/// an emulated master gets to see of a misbehaving device.
pub trait I2cTarget: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), TargetAbort>;

    fn read(&mut self) -> Result<Vec<u8>, TargetAbort>;

    fn finish_transmission(&mut self) -> Result<(), TargetAbort>;
}

/// A device's way of refusing to continue the current transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TargetAbort(pub &'static str);

/// Wiring mistakes caught when a device is attached.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("I2C address {0:#04x} exceeds the 7-bit range")]
    AddressOutOfRange(u8),
    #[error("I2C address {0:#04x} already has a device attached")]
    AddressInUse(u8),
}
