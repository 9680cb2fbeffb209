// Copyright (c) 2025, The Redelivery Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod backoff;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod exchange;
pub mod handler;
pub mod metadata;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod reprocessor;
pub mod retry;
pub mod topology;
