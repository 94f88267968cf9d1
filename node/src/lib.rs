// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod ingest;
pub mod telemetry;
