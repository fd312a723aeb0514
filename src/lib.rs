//! # satcomms
//!
//! A portable, no_std communication stack for a small satellite, covering the
//! two links the flight computer talks over:
//!
//! - the **ground link**, a narrowband half-duplex radio to the ground station,
//!   carrying heartbeats, image downlink and OTA uplink
//! - the **payload link**, a point-to-point serial line to the onboard payload
//!   computer, carrying whole messages with stop-and-wait delivery
//!
//! Hardware and storage are reached only through traits ([`radio::Radio`],
//! [`transport::Transport`], [`telemetry::TelemetryStore`],
//! [`store::ImageStore`], [`store::UploadStore`]) and an
//! `embedded_hal::delay::DelayNs` provider, so the same code runs on the flight
//! board and in host tests.
//!
//! ## Crate features
//! | Feature     | Description |
//! |-------------|-------------|
//! | `std`       | Builds against `std` and enables `std::error::Error` for the error types |
//! | `defmt-0-3` | Logs through `defmt` and derives `defmt::Format` on public types |
//! | `log`       | Logs through `log` |
//!
//! ## Layout
//!
//! | Module          | Role |
//! |-----------------|------|
//! | [`fixed_point`] | Two 4-byte sign-magnitude fixed-point encodings used in telemetry |
//! | [`message`]     | Ground-link message codec and payload builders |
//! | [`session`]     | Ground-link session state and transmit/receive cycle |
//! | [`packet`]      | Payload-link packet codec |
//! | [`transfer`]    | Payload-link stop-and-wait sender and receiver |
//! | [`timer`]       | Tick budgets and bounded polling |
//! | [`consts`]      | Protocol constants and defaults |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use satcomms::session::{GroundLinkConfig, GroundSession};
//!
//! let mut session = GroundSession::new(radio, delay, GroundLinkConfig::default());
//! session.stage_images(&mut store, &["/sd/IMAGES/img0.jpg"])?;
//! loop {
//!     // false once the ground has gone silent
//!     let in_contact = session.exchange(&mut store)?;
//!     # break;
//! }
//! ```
//!
//! ```rust,ignore
//! use satcomms::packet::{PacketSize, PayloadMessage};
//! use satcomms::store::MessageBuffer;
//! use satcomms::transfer::{PayloadLink, PayloadLinkConfig};
//!
//! let mut link = PayloadLink::new(uart, delay, PayloadLinkConfig::default());
//! link.send_message(&PayloadMessage::new(0x60, &command, PacketSize::Compact)?)?;
//!
//! let mut reply: MessageBuffer<4096> = MessageBuffer::new();
//! let summary = link.receive_message(&mut reply)?;
//! ```
//!
//! --
//! Designed for `#![no_std]` use in resource-constrained embedded environments.

#![deny(
    bad_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(
    dead_code,
    unused,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use heapless;

#[macro_use]
mod macros;

pub mod consts;
pub mod fixed_point;
pub mod message;
pub mod packet;
pub mod radio;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod timer;
pub mod transfer;
pub mod transport;
