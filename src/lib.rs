//! A BLE Link Layer controller core.
//!
//! Shale implements the real-time heart of a Bluetooth Low Energy controller: the scheduler that
//! multiplexes advertising and connections onto a single half-duplex radio, the per-connection
//! event state machine (channel hopping, stop-and-wait ARQ, window widening), and the LL Control
//! procedure engine (parameter updates, encryption start/pause, feature/version exchange,
//! data-length negotiation, termination).
//!
//! # Using the stack
//!
//! Shale is runtime- and hardware-agnostic: it does not need an RTOS and talks to the platform
//! exclusively through a [`Config`] bundle of capability traits:
//! * A microsecond-precision [`Timer`].
//! * A [`Transmitter`] that can send data and advertising channel packets.
//! * An RNG and an AES-128 block cipher for connection setup and encryption.
//!
//! All radio and timer control is *return-value driven*: every entry point of [`LinkLayer`]
//! returns a [`Cmd`] telling the platform shim how to configure the radio and when to call back
//! into the stack. The stack never reaches into the radio behind the caller's back.
//!
//! [`Config`]: config/trait.Config.html
//! [`Timer`]: time/trait.Timer.html
//! [`Transmitter`]: link/trait.Transmitter.html
//! [`LinkLayer`]: link/struct.LinkLayer.html
//! [`Cmd`]: link/struct.Cmd.html

// We're `#[no_std]`, except when we're testing
#![cfg_attr(not(test), no_std)]
// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod config;
mod error;
pub mod host;
pub mod link;
pub mod phy;
pub mod time;

pub use self::error::Error;

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth specification implemented by Shale.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V4_2;
