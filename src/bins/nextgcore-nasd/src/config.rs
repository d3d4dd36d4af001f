//! NAS core configuration
//!
//! YAML configuration deserialised with serde. The file carries a single
//! `nasd` section:
//!
//! ```yaml
//! nasd:
//!   gummei:
//!     mcc: "001"
//!     mnc: "01"
//!     mme_gid: 2
//!     mme_code: 1
//!   security:
//!     integrity_order: [EIA2, EIA0]
//!     ciphering_order: [EEA0, EEA2]
//!   timers:
//!     t3460: { duration_secs: 6, max_retries: 4 }
//!   max_auth_vectors: 1
//!   default_apn: internet
//! ```

use std::path::Path;
use std::time::Duration;

use ogs_crypt::nas_alg;
use serde::{Deserialize, Serialize};

use crate::context::{Gummei, PlmnId};
use crate::error::{NasError, NasResult};
use crate::timer::NasTimer;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nextgcore/nasd.yaml";

/// Upper bound on authentication vectors requested per S6a exchange
pub const MAX_AUTH_VECTORS: u8 = 5;

// ============================================================================
// Sections
// ============================================================================

/// GUMMEI served by this MME
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GummeiConfig {
    /// Mobile country code (3 digits)
    pub mcc: String,
    /// Mobile network code (2 or 3 digits)
    pub mnc: String,
    /// MME group id
    pub mme_gid: u16,
    /// MME code
    pub mme_code: u8,
}

impl Default for GummeiConfig {
    fn default() -> Self {
        Self {
            mcc: "001".to_string(),
            mnc: "01".to_string(),
            mme_gid: 2,
            mme_code: 1,
        }
    }
}

impl GummeiConfig {
    /// Build the GUMMEI used for GUTI allocation
    pub fn gummei(&self) -> Gummei {
        Gummei {
            plmn_id: PlmnId::new(&self.mcc, &self.mnc),
            mme_gid: self.mme_gid,
            mme_code: self.mme_code,
        }
    }
}

/// NAS security algorithm preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Integrity algorithms, most preferred first
    pub integrity_order: Vec<String>,
    /// Ciphering algorithms, most preferred first
    pub ciphering_order: Vec<String>,
    /// Allow EIA0 to be negotiated
    pub allow_null_integrity: bool,
    /// Allow EEA0 to be negotiated
    pub allow_null_ciphering: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            integrity_order: vec!["EIA2".to_string()],
            ciphering_order: vec!["EEA2".to_string(), "EEA0".to_string()],
            allow_null_integrity: false,
            allow_null_ciphering: true,
        }
    }
}

/// Parsed security policy handed to the security engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Integrity algorithm identities in priority order
    pub integrity_order: Vec<u8>,
    /// Ciphering algorithm identities in priority order
    pub ciphering_order: Vec<u8>,
    /// EIA0 permitted
    pub allow_null_integrity: bool,
    /// EEA0 permitted
    pub allow_null_ciphering: bool,
}

/// Parse an integrity algorithm name to its identity
fn parse_integrity_algorithm(name: &str) -> Option<u8> {
    match name.to_uppercase().as_str() {
        "EIA0" => Some(0),
        "EIA1" | "128-EIA1" => Some(1),
        "EIA2" | "128-EIA2" => Some(2),
        "EIA3" | "128-EIA3" => Some(3),
        _ => None,
    }
}

/// Parse a ciphering algorithm name to its identity
fn parse_ciphering_algorithm(name: &str) -> Option<u8> {
    match name.to_uppercase().as_str() {
        "EEA0" => Some(0),
        "EEA1" | "128-EEA1" => Some(1),
        "EEA2" | "128-EEA2" => Some(2),
        "EEA3" | "128-EEA3" => Some(3),
        _ => None,
    }
}

fn parse_order(
    names: &[String],
    what: &str,
    parse: fn(&str) -> Option<u8>,
) -> NasResult<Vec<u8>> {
    if names.is_empty() {
        return Err(NasError::Config(format!("{what} order is empty")));
    }
    names
        .iter()
        .map(|name| {
            let alg = parse(name).ok_or_else(|| NasError::Config(format!("unknown {what} algorithm '{name}'")))?;
            if !nas_alg::is_supported(alg) {
                return Err(NasError::Config(format!("{what} algorithm '{name}' is not supported")));
            }
            Ok(alg)
        })
        .collect()
}

impl SecurityConfig {
    /// Validate and convert into a policy
    pub fn policy(&self) -> NasResult<SecurityPolicy> {
        Ok(SecurityPolicy {
            integrity_order: parse_order(&self.integrity_order, "integrity", parse_integrity_algorithm)?,
            ciphering_order: parse_order(&self.ciphering_order, "ciphering", parse_ciphering_algorithm)?,
            allow_null_integrity: self.allow_null_integrity,
            allow_null_ciphering: self.allow_null_ciphering,
        })
    }
}

/// Timer value with retransmission bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerValue {
    /// Expiry in seconds
    pub duration_secs: u64,
    /// Retransmissions before the procedure is aborted
    pub max_retries: u32,
}

impl TimerValue {
    /// Create a new timer value
    pub const fn new(duration_secs: u64, max_retries: u32) -> Self {
        Self { duration_secs, max_retries }
    }

    /// Timer duration
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Procedure timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// T3450 - Attach accept / TAU accept sent
    pub t3450: TimerValue,
    /// T3460 - Authentication request / Security mode command sent
    pub t3460: TimerValue,
    /// T3470 - Identity request sent
    pub t3470: TimerValue,
    /// T3422 - Network initiated detach request sent
    pub t3422: TimerValue,
    /// T3485 - Activate default/dedicated bearer request sent
    pub t3485: TimerValue,
    /// T3486 - Modify bearer request sent
    pub t3486: TimerValue,
    /// T3495 - Deactivate bearer request sent
    pub t3495: TimerValue,
    /// S6a authentication information guard
    pub s6a: TimerValue,
    /// S10 context request guard
    pub s10: TimerValue,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            t3450: TimerValue::new(6, 4),
            t3460: TimerValue::new(6, 4),
            t3470: TimerValue::new(6, 4),
            t3422: TimerValue::new(6, 4),
            t3485: TimerValue::new(8, 4),
            t3486: TimerValue::new(8, 4),
            t3495: TimerValue::new(8, 4),
            s6a: TimerValue::new(5, 2),
            s10: TimerValue::new(5, 2),
        }
    }
}

impl TimersConfig {
    /// Get timer value by timer id
    pub fn get(&self, timer: NasTimer) -> TimerValue {
        match timer {
            NasTimer::T3450 => self.t3450,
            NasTimer::T3460 => self.t3460,
            NasTimer::T3470 => self.t3470,
            NasTimer::T3422 => self.t3422,
            NasTimer::T3485 => self.t3485,
            NasTimer::T3486 => self.t3486,
            NasTimer::T3495 => self.t3495,
            NasTimer::S6a => self.s6a,
            NasTimer::S10 => self.s10,
        }
    }

    fn all(&self) -> [(NasTimer, TimerValue); 9] {
        [
            NasTimer::T3450,
            NasTimer::T3460,
            NasTimer::T3470,
            NasTimer::T3422,
            NasTimer::T3485,
            NasTimer::T3486,
            NasTimer::T3495,
            NasTimer::S6a,
            NasTimer::S10,
        ]
        .map(|t| (t, self.get(t)))
    }
}

// ============================================================================
// NAS configuration
// ============================================================================

/// NAS core configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NasConfig {
    /// Served GUMMEI
    pub gummei: GummeiConfig,
    /// Security algorithm policy
    pub security: SecurityConfig,
    /// Procedure timers
    pub timers: TimersConfig,
    /// Authentication vectors requested from the HSS (1-5)
    pub max_auth_vectors: u8,
    /// APN used when the UE does not request one
    pub default_apn: String,
}

impl Default for NasConfig {
    fn default() -> Self {
        Self {
            gummei: GummeiConfig::default(),
            security: SecurityConfig::default(),
            timers: TimersConfig::default(),
            max_auth_vectors: 1,
            default_apn: "internet".to_string(),
        }
    }
}

/// On-disk layout: everything lives under the `nasd` key
#[derive(Debug, Deserialize)]
struct ConfigFile {
    nasd: Option<NasConfig>,
}

impl NasConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> NasResult<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| NasError::Config(format!("failed to parse YAML config: {e}")))?;

        let config = match file.nasd {
            Some(config) => config,
            None => {
                log::warn!("No 'nasd' section in config file, using defaults");
                NasConfig::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    ///
    /// A missing file falls back to defaults; an unreadable or malformed file
    /// is an error.
    pub fn load(path: impl AsRef<Path>) -> NasResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from: {}", path.display());

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file '{}' not found. Using defaults.", path.display());
                return Ok(NasConfig::default());
            }
            Err(e) => {
                return Err(NasError::Config(format!("could not read '{}': {e}", path.display())));
            }
        };

        let config = Self::from_yaml_str(&content)?;
        log::info!(
            "NAS configuration loaded: PLMN {}, MME GID {}, MME code {}",
            config.gummei.gummei().plmn_id,
            config.gummei.mme_gid,
            config.gummei.mme_code
        );
        Ok(config)
    }

    /// Check value ranges and algorithm lists
    pub fn validate(&self) -> NasResult<()> {
        if self.max_auth_vectors == 0 || self.max_auth_vectors > MAX_AUTH_VECTORS {
            return Err(NasError::Config(format!(
                "max_auth_vectors must be 1..={MAX_AUTH_VECTORS}, got {}",
                self.max_auth_vectors
            )));
        }
        if self.gummei.mcc.len() != 3 || !(2..=3).contains(&self.gummei.mnc.len()) {
            return Err(NasError::Config(format!(
                "invalid PLMN {}/{}",
                self.gummei.mcc, self.gummei.mnc
            )));
        }
        if self.default_apn.is_empty() {
            return Err(NasError::Config("default_apn is empty".to_string()));
        }
        for (timer, value) in self.timers.all() {
            if value.duration_secs == 0 {
                return Err(NasError::Config(format!("{} duration must be non-zero", timer.name())));
            }
        }
        self.security.policy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NasConfig::default();
        assert!(config.validate().is_ok());
        let policy = config.security.policy().unwrap();
        assert_eq!(policy.integrity_order, vec![2]);
        assert_eq!(policy.ciphering_order, vec![2, 0]);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
nasd:
  gummei:
    mcc: "208"
    mnc: "93"
    mme_gid: 4
    mme_code: 7
  security:
    integrity_order: [EIA2, EIA0]
    ciphering_order: [EEA0]
    allow_null_integrity: true
  timers:
    t3460: { duration_secs: 3, max_retries: 2 }
  max_auth_vectors: 3
  default_apn: ims
"#;
        let config = NasConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.gummei.mme_gid, 4);
        assert_eq!(config.timers.t3460, TimerValue::new(3, 2));
        // Unspecified timers keep their defaults
        assert_eq!(config.timers.t3450, TimerValue::new(6, 4));
        assert_eq!(config.max_auth_vectors, 3);
        assert_eq!(config.default_apn, "ims");
        assert!(config.security.allow_null_integrity);
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let config = NasConfig::from_yaml_str("other: 1\n").unwrap();
        assert_eq!(config, NasConfig::default());
    }

    #[test]
    fn test_reject_unsupported_algorithm() {
        let yaml = "nasd:\n  security:\n    integrity_order: [EIA1]\n";
        assert!(matches!(NasConfig::from_yaml_str(yaml), Err(NasError::Config(_))));
    }

    #[test]
    fn test_reject_vector_count() {
        let yaml = "nasd:\n  max_auth_vectors: 9\n";
        assert!(matches!(NasConfig::from_yaml_str(yaml), Err(NasError::Config(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(NasConfig::from_yaml_str("nasd: ["), Err(NasError::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = NasConfig::load("/nonexistent/nextgcore/nasd.yaml").unwrap();
        assert_eq!(config, NasConfig::default());
    }
}
