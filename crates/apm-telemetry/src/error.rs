// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Configuration could not be read from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Synchronous rejection of a document handed to the reporter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid document: {0}")]
    InvalidDocument(&'static str),

    #[error("Reporter queue is full, document dropped")]
    QueueFull,

    #[error("Reporter is shut down")]
    Closed,
}

/// Synchronous rejection of a reconciliation request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateRequestError {
    #[error("Correlation keys are missing or blank")]
    MissingCorrelationKeys,

    #[error("Patch has no fields")]
    EmptyPatch,

    #[error("Reconciliation queue is full, update dropped")]
    QueueFull,

    #[error("Reconciliation worker is shut down")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("could not parse log level: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    #[error("Shutdown did not finish within {0:?}")]
    Timeout(std::time::Duration),
}
