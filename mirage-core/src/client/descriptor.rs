//! Client descriptor: announce query and header templating

use std::net::IpAddr;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::encoding::{HexCase, UrlEncoder};
use super::generator::{KeyGenerator, KeyGeneratorSpec, PeerIdGenerator, PeerIdGeneratorSpec};
use super::numwant::NumwantProvider;
use super::{ConnectionInfo, TemplateError};
use crate::bandwidth::SeedStats;
use crate::config::ClientEnvironment;
use crate::torrent::InfoHash;
use crate::tracker::AnnounceEvent;

/// Client file as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptorSpec {
    pub peer_id_generator: PeerIdGeneratorSpec,
    #[serde(default)]
    pub key_generator: Option<KeyGeneratorSpec>,
    pub url_encoder: UrlEncoderSpec,
    pub numwant: i64,
    pub numwant_on_stop: i64,
    pub query: String,
    #[serde(default)]
    pub request_headers: Vec<HeaderTemplate>,
}

/// `urlEncoder` section of a client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlEncoderSpec {
    pub encoding_exclusion_pattern: String,
    pub encoded_hex_case: HexCase,
}

/// Header name and value template, sent in file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderTemplate {
    pub name: String,
    pub value: String,
}

/// Regexes used while rendering, compiled once per descriptor.
#[derive(Debug)]
struct Patterns {
    ip_fragment: Regex,
    ipv6_fragment: Regex,
    event_fragment: Regex,
    ampersand_runs: Regex,
    leftover_placeholder: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, TemplateError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| TemplateError::InvalidDescriptor {
                reason: format!("internal pattern {pattern}: {e}"),
            })
        };

        Ok(Self {
            ip_fragment: compile(r"&*[a-zA-Z0-9]+=\{ip\}")?,
            ipv6_fragment: compile(r"&*[a-zA-Z0-9]+=\{ipv6\}")?,
            event_fragment: compile(r"&*[a-zA-Z0-9]+=\{event\}")?,
            ampersand_runs: compile(r"&{2,}")?,
            leftover_placeholder: compile(r"\{[^{}]*\}|[{}]")?,
        })
    }
}

/// Immutable emulated client, shared by every announcer.
///
/// Rendering is deterministic apart from the generated identifiers, and a
/// rendered string never contains an unresolved placeholder.
#[derive(Debug)]
pub struct ClientDescriptor {
    query: String,
    headers: Vec<HeaderTemplate>,
    peer_id_generator: PeerIdGenerator,
    key_generator: Option<KeyGenerator>,
    url_encoder: UrlEncoder,
    numwant: NumwantProvider,
    environment: ClientEnvironment,
    patterns: Patterns,
}

impl ClientDescriptor {
    /// Validates a client file and builds its generators.
    ///
    /// # Errors
    /// - `TemplateError::InvalidDescriptor` - Blank query or numwant out of range
    /// - `TemplateError::InvalidGenerator` - Unsupported peer-id or key algorithm
    /// - `TemplateError::InvalidEncoderPattern` - Exclusion pattern is not a valid regex
    pub fn from_spec(
        spec: ClientDescriptorSpec,
        environment: ClientEnvironment,
    ) -> Result<Self, TemplateError> {
        if spec.query.trim().is_empty() {
            return Err(TemplateError::InvalidDescriptor {
                reason: "query must not be empty".to_string(),
            });
        }

        let key_generator = spec
            .key_generator
            .as_ref()
            .map(KeyGenerator::from_spec)
            .transpose()?;

        Ok(Self {
            peer_id_generator: PeerIdGenerator::from_spec(&spec.peer_id_generator)?,
            key_generator,
            url_encoder: UrlEncoder::new(
                &spec.url_encoder.encoding_exclusion_pattern,
                spec.url_encoder.encoded_hex_case,
            )?,
            numwant: NumwantProvider::new(spec.numwant, spec.numwant_on_stop)?,
            query: spec.query,
            headers: spec.request_headers,
            environment,
            patterns: Patterns::compile()?,
        })
    }

    /// Parses a client file from JSON.
    ///
    /// # Errors
    /// - `TemplateError::Parse` - Malformed JSON or unknown algorithm
    /// - Any error from [`ClientDescriptor::from_spec`]
    pub fn from_json(json: &str, environment: ClientEnvironment) -> Result<Self, TemplateError> {
        let spec: ClientDescriptorSpec = serde_json::from_str(json)?;
        Self::from_spec(spec, environment)
    }

    /// Reads a client file from disk.
    ///
    /// # Errors
    /// - `TemplateError::Io` - File could not be read
    /// - Any error from [`ClientDescriptor::from_json`]
    pub async fn load(path: &Path, environment: ClientEnvironment) -> Result<Self, TemplateError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_json(&contents, environment)
    }

    pub fn query_template(&self) -> &str {
        &self.query
    }

    pub fn peer_id_generator(&self) -> &PeerIdGenerator {
        &self.peer_id_generator
    }

    pub fn key_generator(&self) -> Option<&KeyGenerator> {
        self.key_generator.as_ref()
    }

    /// Renders the announce query string.
    ///
    /// # Errors
    /// - `TemplateError::MissingKeyGenerator` - Query uses `{key}` without a key generator
    /// - `TemplateError::UnrecognizedPlaceholder` - A placeholder or brace survives rendering
    pub fn render_query(
        &self,
        event: AnnounceEvent,
        info_hash: InfoHash,
        stats: &SeedStats,
        connection: &ConnectionInfo,
    ) -> Result<String, TemplateError> {
        let mut query = self
            .query
            .replace(
                "{infohash}",
                &self.url_encoder.encode_bytes(info_hash.as_bytes()),
            )
            .replace("{uploaded}", &stats.uploaded.to_string())
            .replace("{downloaded}", &stats.downloaded.to_string())
            .replace("{left}", &stats.left.to_string())
            .replace("{port}", &connection.port.to_string())
            .replace("{numwant}", &self.numwant.get(event).to_string());

        let peer_id = self.peer_id_generator.get(info_hash, event);
        let peer_id = if self.peer_id_generator.should_url_encode() {
            self.url_encoder.encode_str(&peer_id)
        } else {
            peer_id
        };
        query = query.replace("{peerid}", &peer_id);

        query = match connection.ip {
            IpAddr::V4(ip) => query.replace("{ip}", &ip.to_string()),
            IpAddr::V6(ip) => {
                query.replace("{ipv6}", &self.url_encoder.encode_str(&ip.to_string()))
            }
        };
        query = self
            .patterns
            .ipv6_fragment
            .replace_all(&query, "")
            .into_owned();
        query = self.patterns.ip_fragment.replace_all(&query, "").into_owned();

        query = match event.name() {
            Some(name) => query.replace("{event}", name),
            None => self
                .patterns
                .event_fragment
                .replace_all(&query, "")
                .into_owned(),
        };

        if query.contains("{key}") {
            let key_generator = self
                .key_generator
                .as_ref()
                .ok_or(TemplateError::MissingKeyGenerator)?;
            let key = key_generator.get(info_hash, event);
            query = query.replace("{key}", &self.url_encoder.encode_str(&key));
        }

        let query = self.patterns.ampersand_runs.replace_all(&query, "&");
        let query = query.trim_matches('&').to_string();

        self.reject_leftovers(&query, "announce query")?;
        Ok(query)
    }

    /// Renders request headers in template order.
    ///
    /// # Errors
    /// - `TemplateError::UnrecognizedPlaceholder` - A header value keeps a placeholder
    pub fn render_headers(&self) -> Result<Vec<(String, String)>, TemplateError> {
        self.headers
            .iter()
            .map(|header| {
                let value = header
                    .value
                    .replace("{java}", &self.environment.java_version)
                    .replace("{os}", &self.environment.os_name)
                    .replace("{locale}", &self.environment.locale);
                self.reject_leftovers(&value, "client headers")?;
                Ok((header.name.clone(), value))
            })
            .collect()
    }

    /// Rendered `User-Agent` header, if the client sends one.
    pub fn user_agent(&self) -> Option<String> {
        self.render_headers()
            .ok()?
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
            .map(|(_, value)| value)
    }

    fn reject_leftovers(&self, rendered: &str, context: &'static str) -> Result<(), TemplateError> {
        match self.patterns.leftover_placeholder.find(rendered) {
            Some(found) => Err(TemplateError::UnrecognizedPlaceholder {
                placeholder: found.as_str().to_string(),
                context,
            }),
            None => Ok(()),
        }
    }
}
