use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarmonizeError {
    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Count mismatch: {measurements} {source_kind} but {covariates} rows in covariate file")]
    CountMismatchError {
        source_kind: String,
        measurements: usize,
        covariates: usize,
    },

    #[error("Subject mismatch: {message}")]
    SubjectMismatchError { message: String },

    #[error("Covariate column '{column}': {message}")]
    CovariateError { column: String, message: String },

    #[error("NIfTI error in {path}: {message}")]
    NiftiError { path: String, message: String },

    #[error("Design matrix is singular: {message}")]
    SingularDesignError { message: String },

    #[error("Numeric error: {message}")]
    NumericError { message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Io,
    Configuration,
    InputData,
    Statistics,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// 依嚴重程度決定行程結束碼
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Low => 0,
            Self::Medium => 2,
            Self::High => 1,
            Self::Critical => 3,
        }
    }
}

impl HarmonizeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::IoError(_) => ErrorCategory::Io,
            Self::ConfigError { .. }
            | Self::ConfigValidationError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. } => ErrorCategory::Configuration,
            Self::CsvError(_)
            | Self::CountMismatchError { .. }
            | Self::SubjectMismatchError { .. }
            | Self::CovariateError { .. }
            | Self::NiftiError { .. }
            | Self::ValidationError { .. } => ErrorCategory::InputData,
            Self::SingularDesignError { .. } | Self::NumericError { .. } => {
                ErrorCategory::Statistics
            }
            Self::SerializationError(_) | Self::ProcessingError { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::InputData => ErrorSeverity::High,
            ErrorCategory::Statistics => ErrorSeverity::Medium,
            ErrorCategory::Io | ErrorCategory::Internal => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            Self::IoError(_) => "Check that the path exists and is readable/writable".to_string(),
            Self::CsvError(_) => {
                "Check the delimiter and that every row has the same number of columns".to_string()
            }
            Self::ConfigError { .. }
            | Self::ConfigValidationError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::MissingConfigError { .. } => {
                "Fix the configuration value and rerun; use --dry-run to preview a TOML job"
                    .to_string()
            }
            Self::CountMismatchError { .. } => {
                "Make sure every subject has exactly one measurement row or image and one covariate row"
                    .to_string()
            }
            Self::SubjectMismatchError { .. } => {
                "Check that subject ids in both sources use the same naming, or align by order"
                    .to_string()
            }
            Self::CovariateError { .. } => {
                "Check the column name and that continuous covariates contain only numbers"
                    .to_string()
            }
            Self::NiftiError { .. } => {
                "Only single-file 3D NIfTI-1 images are supported; split 4D files first (e.g. fslsplit)"
                    .to_string()
            }
            Self::SingularDesignError { .. } => {
                "A covariate is probably confounded with site; drop it or merge small sites"
                    .to_string()
            }
            Self::NumericError { .. } => {
                "Check for constant features or sites with a single subject".to_string()
            }
            Self::SerializationError(_) | Self::ProcessingError { .. } | Self::ValidationError { .. } => {
                "Rerun with --verbose for details".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            Self::CountMismatchError {
                source_kind,
                measurements,
                covariates,
            } => format!(
                "the number of {} ({}) and rows in the covariate file ({}) are unequal",
                source_kind, measurements, covariates
            ),
            Self::MissingConfigError { field } => format!("missing required setting '{}'", field),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarmonizeError>;
