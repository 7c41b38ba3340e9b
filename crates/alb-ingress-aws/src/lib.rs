//! Typed AWS API surface for the ALB ingress controller.
//!
//! The reconciliation tree never touches SDK request/response shapes
//! directly; it speaks the domain types in [`types`] through the
//! [`ElbApi`] and [`Ec2Api`] traits. The SDK-backed implementations here
//! own all conversion, pagination and error classification.

#![deny(missing_docs)]

pub mod ec2;
pub mod elbv2;
mod sdk;
pub mod types;

pub use ec2::{AwsEc2, Ec2Api};
pub use elbv2::{AwsElb, ElbApi};
