//! # Unit Identifiers
//!
//! Units are addressed by URL:
//!
//! ```text
//! file:<path>/<Name>.unit
//! installbundle:<path>/<Name>.unit?Bundles=A,B
//! ```
//!
//! The identifying string is the URL up to (excluding) the first `?`; two
//! URLs that differ only in their options name the same unit. Creating a
//! [`UnitIdentifier`] only validates the protocol prefix. The full parse
//! (descriptor path, unit name, protocol metadata) happens while the unit is
//! checking its status, so a bad URL surfaces as a transition error rather
//! than a construction failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{OptionsError, ProtocolMetadata, OPTION_SEPARATOR};

/// Extension every unit descriptor carries.
pub const DESCRIPTOR_EXTENSION: &str = "unit";

/// How a unit's content is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Content already on local disk.
    File,
    /// Content delivered as installable bundles.
    InstallBundle,
}

impl Protocol {
    /// URL prefix including the trailing colon.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::File => "file:",
            Self::InstallBundle => "installbundle:",
        }
    }

    /// Detect the protocol of a URL from its prefix.
    pub fn of_url(url: &str) -> Option<Protocol> {
        [Protocol::File, Protocol::InstallBundle]
            .into_iter()
            .find(|p| url.starts_with(p.prefix()))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::InstallBundle => "installbundle",
        })
    }
}

/// Errors raised while parsing a unit URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// The URL did not start with a known protocol prefix.
    #[error("unknown protocol in unit URL: {0}")]
    UnknownProtocol(String),

    /// The path part of the URL was empty.
    #[error("unit URL has an empty path: {0}")]
    EmptyPath(String),

    /// The descriptor did not carry the expected extension.
    #[error("unit descriptor must have a .{DESCRIPTOR_EXTENSION} extension: {0}")]
    BadExtension(String),

    /// The descriptor's file stem was empty.
    #[error("unit descriptor has no name: {0}")]
    MissingName(String),

    /// The options part of the URL was invalid.
    #[error("invalid URL options: {0}")]
    Options(#[from] OptionsError),
}

/// The identity of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitIdentifier {
    url: String,
    protocol: Protocol,
}

impl UnitIdentifier {
    /// Accept a URL with a recognised protocol prefix.
    pub fn new(url: impl Into<String>) -> Result<Self, IdentifierError> {
        let url = url.into();
        let protocol =
            Protocol::of_url(&url).ok_or_else(|| IdentifierError::UnknownProtocol(url.clone()))?;
        Ok(Self { url, protocol })
    }

    /// The full URL, including options.
    pub fn full_url(&self) -> &str {
        &self.url
    }

    /// The URL up to the first `?`; equal for every URL naming this unit.
    pub fn identifying_str(&self) -> &str {
        match self.url.find(OPTION_SEPARATOR) {
            Some(idx) => &self.url[..idx],
            None => &self.url,
        }
    }

    /// The unit's protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Full parse of the URL.
    pub fn parse(&self) -> Result<ParsedUnit, IdentifierError> {
        let without_prefix = &self.url[self.protocol.prefix().len()..];
        let (path, options) = match without_prefix.find(OPTION_SEPARATOR) {
            Some(idx) => (&without_prefix[..idx], &without_prefix[idx..]),
            None => (without_prefix, ""),
        };
        if path.is_empty() {
            return Err(IdentifierError::EmptyPath(self.url.clone()));
        }

        let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let name = match file_name.rsplit_once('.') {
            Some((stem, ext)) if ext == DESCRIPTOR_EXTENSION => stem,
            _ => return Err(IdentifierError::BadExtension(path.to_string())),
        };
        if name.is_empty() {
            return Err(IdentifierError::MissingName(path.to_string()));
        }

        let metadata = ProtocolMetadata::from_url_options(self.protocol, options)?;
        Ok(ParsedUnit {
            descriptor_path: path.to_string(),
            name: name.to_string(),
            metadata,
        })
    }
}

impl std::fmt::Display for UnitIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifying_str())
    }
}

/// Result of fully parsing a unit URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUnit {
    /// Path to the unit descriptor.
    pub descriptor_path: String,
    /// Unit name (descriptor file stem).
    pub name: String,
    /// Protocol data from the URL options.
    pub metadata: ProtocolMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BundleId;

    #[test]
    fn file_url_parses() {
        let id = UnitIdentifier::new("file:/units/Weather/Weather.unit").unwrap();
        assert_eq!(id.protocol(), Protocol::File);
        let parsed = id.parse().unwrap();
        assert_eq!(parsed.name, "Weather");
        assert_eq!(parsed.descriptor_path, "/units/Weather/Weather.unit");
        assert_eq!(parsed.metadata, ProtocolMetadata::File);
    }

    #[test]
    fn bundle_url_parses_bundles() {
        let id = UnitIdentifier::new("installbundle:/dlc/Maps.unit?Bundles=MapsCore,MapsHd").unwrap();
        assert_eq!(id.identifying_str(), "installbundle:/dlc/Maps.unit");
        let parsed = id.parse().unwrap();
        assert_eq!(parsed.name, "Maps");
        assert_eq!(
            parsed.metadata.bundles(),
            &[BundleId::from("MapsCore"), BundleId::from("MapsHd")]
        );
    }

    #[test]
    fn identifying_string_ignores_options() {
        let a = UnitIdentifier::new("installbundle:/dlc/Maps.unit?Bundles=A").unwrap();
        let b = UnitIdentifier::new("installbundle:/dlc/Maps.unit?Bundles=A,B").unwrap();
        assert_eq!(a.identifying_str(), b.identifying_str());
        assert_eq!(a.to_string(), "installbundle:/dlc/Maps.unit");
    }

    #[test]
    fn unknown_protocol_rejected_at_construction() {
        assert!(matches!(
            UnitIdentifier::new("ftp:/x/Y.unit"),
            Err(IdentifierError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn bad_descriptor_fails_parse() {
        let id = UnitIdentifier::new("file:/units/Weather.txt").unwrap();
        assert!(matches!(id.parse(), Err(IdentifierError::BadExtension(_))));

        let id = UnitIdentifier::new("file:/units/.unit").unwrap();
        assert!(matches!(id.parse(), Err(IdentifierError::MissingName(_))));

        let id = UnitIdentifier::new("file:").unwrap();
        assert!(matches!(id.parse(), Err(IdentifierError::EmptyPath(_))));
    }

    #[test]
    fn bundle_url_without_bundles_fails_parse() {
        let id = UnitIdentifier::new("installbundle:/dlc/Maps.unit").unwrap();
        assert!(matches!(id.parse(), Err(IdentifierError::Options(_))));
    }
}
