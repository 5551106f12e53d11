use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Consumer for topic {topic} already exists"))]
    DuplicateConsumer { topic: String },

    #[snafu(display("Concurrency for topic {topic} is zero"))]
    ZeroConcurrency { topic: String },

    #[snafu(display("Concurrency {concurrency} for topic {topic} exceeds the maximum of {max}"))]
    ConcurrencyTooHigh {
        topic: String,
        concurrency: usize,
        max: usize,
    },

    #[snafu(display("No consumer for topic: {topic}"))]
    UnknownTopic { topic: String },

    #[snafu(display("Invalid payload for topic {topic}: {source}"))]
    InvalidPayload {
        topic: String,
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Cascade from topic {topic} is nested deeper than {max} levels"))]
    CascadeTooDeep { topic: String, max: usize },

    #[snafu(display("Error serializing payload"))]
    Serialize {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Invalid configuration"))]
    Config {
        #[snafu(source)]
        source: envy::Error,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<envy::Error> for Error {
    fn from(source: envy::Error) -> Self {
        Self::Config { source }
    }
}

impl Error {
    pub fn unknown_topic(topic: impl Into<String>) -> Self {
        Self::UnknownTopic {
            topic: topic.into(),
        }
    }

    /// Raised while registering consumers.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateConsumer { .. }
                | Self::ZeroConcurrency { .. }
                | Self::ConcurrencyTooHigh { .. }
        )
    }

    /// Raised by publish before anything is written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownTopic { .. } | Self::InvalidPayload { .. } | Self::CascadeTooDeep { .. }
        )
    }
}
