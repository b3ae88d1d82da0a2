//! Layered loading of service declarations.
//!
//! A service is declared in a YAML or JSON file and may be tweaked through prefixed environment variables. Sources
//! are merged in the order they are added, with later sources taking precedence, and the merged result is
//! deserialized into a caller-provided type exactly once.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, path::Path};

use drydock_error::GenericError;
use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// The file extension did not map to a supported format.
    #[snafu(display("Unsupported configuration file '{}'. Expected a .yaml, .yml or .json file.", path))]
    UnsupportedFormat {
        /// Path of the rejected file.
        path: String,
    },

    /// A required field was missing.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field, including the environment variable to use if
        /// environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// A field had the wrong data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other loading or extraction failure.
    #[snafu(display("Failed to load configuration: {}", source))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from files and the environment.
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefix: Option<String>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = FileProvider::from_yaml(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = FileProvider::from_json(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads the given file, picking the format from its extension.
    ///
    /// # Errors
    ///
    /// If the extension is not one of `yaml`, `yml` or `json`, or the file cannot be loaded, an error is returned.
    pub fn from_path<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => self.from_yaml(path),
            Some("json") => self.from_json(path),
            _ => Err(ConfigurationError::UnsupportedFormat {
                path: path.display().to_string(),
            }),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `drydock`, `DRYDOCK_VERSION` sets the `version` field. A double underscore descends into nested
    /// values, so `DRYDOCK_HEALTH_CHECK__RETRIES` sets `health_check.retries`.
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment cannot be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` isn't `Send + Sync`, so snapshot it into a serialized provider.
        let values = Env::prefixed(&prefix)
            .split("__")
            .data()
            .map_err(GenericError::from)
            .context(Generic)?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
        }
        self.env_prefix = Some(prefix);
        Ok(self)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        figment
            .extract()
            .map_err(|e| from_figment_error(self.env_prefix.as_deref(), e))
    }
}

fn from_figment_error(env_prefix: Option<&str>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let path = e.path.iter().map(String::as_str).chain([field.as_ref()]).collect::<Vec<_>>();
            let mut help_text = format!("Try setting `{}`", path.join("."));
            if let Some(prefix) = env_prefix {
                help_text.push_str(&format!(" or `{}{}`", prefix, path.join("__").to_uppercase()));
            }
            help_text.push('.');

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
