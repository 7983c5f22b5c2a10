use std::path::PathBuf;
use std::str::FromStr;

use envconfig::Envconfig;
use loader_common::budget::WriteBudget;
use loader_common::mapping::{Delimiter, FieldMapping, RecordMapper};
use loader_common::store::StoreSettings;

use crate::error::LoaderError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    pub input_path: Option<PathBuf>,

    #[envconfig(default = ".")]
    pub output_dir: PathBuf,

    #[envconfig(default = "25")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub writes_per_second: u32,

    pub max_in_flight_batches: Option<usize>,

    #[envconfig(default = "my-table")]
    pub table: NonEmptyString,

    #[envconfig(default = "Attribute1,Attribute2,Attribute3")]
    pub mapping: FieldMapping,

    #[envconfig(default = "31")]
    pub field_delimiter: Delimiter,

    #[envconfig(from = "AWS_ACCESS_KEY")]
    pub aws_access_key: Option<String>,

    #[envconfig(from = "AWS_SECRET_KEY")]
    pub aws_secret_key: Option<String>,

    #[envconfig(default = "us-west-2")]
    pub aws_region: String,

    pub dynamodb_endpoint: Option<String>,

    #[envconfig(default = "false")]
    pub dry_run: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            region: self.aws_region.clone(),
            endpoint_url: self.dynamodb_endpoint.clone(),
            access_key: self.aws_access_key.clone(),
            secret_key: self.aws_secret_key.clone(),
        }
    }

    /// Validate this configuration into the settings of a single run. `input_override` takes
    /// precedence over `INPUT_PATH`.
    pub fn pipeline_settings(
        &self,
        input_override: Option<PathBuf>,
    ) -> Result<PipelineSettings, LoaderError> {
        let input_path = input_override
            .or_else(|| self.input_path.clone())
            .ok_or(LoaderError::MissingInput)?;

        let budget = WriteBudget::new(self.batch_size, self.writes_per_second)?;

        let max_in_flight = match self.max_in_flight_batches {
            Some(0) => return Err(LoaderError::InvalidMaxInFlight),
            Some(max) => max,
            None => budget.default_max_in_flight(),
        };

        Ok(PipelineSettings {
            input_path,
            output_dir: self.output_dir.clone(),
            budget,
            max_in_flight,
            table: self.table.as_str().to_owned(),
            mapper: RecordMapper::new(self.mapping.clone(), self.field_delimiter),
            dry_run: self.dry_run,
        })
    }
}

/// Everything a single load needs, validated once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub budget: WriteBudget,
    pub max_in_flight: usize,
    pub table: String,
    pub mapper: RecordMapper,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
