//! Table line parsing
//!
//! Two forms are accepted:
//!
//! ```text
//! <begin> <len> default-key <cipher> <key_hex> <iv_offset> <dev_path> <start> [<#opts>] [opts...]
//!                           <cipher> <key_hex> <iv_offset> <dev_path> <start> [<#opts>] [opts...]
//! ```
//!
//! The first is a full table line and also provides the mapped region; the
//! second is the bare target argument list. Optional arguments may be
//! preceded by their count, which is how status output renders them.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::key::{CipherMode, KeyMaterial};
use crate::target::MappingOptions;

/// Target type name in table lines.
pub const TARGET_NAME: &str = "default-key";

/// Number of mandatory target arguments.
pub const REQUIRED_ARGS: usize = 5;

// =============================================================================
// Table Line
// =============================================================================

/// Position of the key among the target arguments.
const KEY_ARG: usize = 1;

/// `<begin> <len> <target> <args...>`
///
/// The target arguments include the key and are zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct TableLine {
    /// First virtual sector covered by the target
    pub begin: u64,
    /// Number of sectors covered
    pub length: u64,
    pub target: String,
    args: Vec<Zeroizing<String>>,
}

impl TableLine {
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            return Err(ConfigError::MalformedTable(
                "expected <begin> <len> <target> <args...>".into(),
            ));
        }

        let begin = tokens[0]
            .parse::<u64>()
            .map_err(|_| ConfigError::MalformedTable(format!("invalid begin '{}'", tokens[0])))?;
        let length = tokens[1]
            .parse::<u64>()
            .map_err(|_| ConfigError::MalformedTable(format!("invalid length '{}'", tokens[1])))?;

        if tokens[2] != TARGET_NAME {
            return Err(ConfigError::MalformedTable(format!(
                "unknown target type '{}'",
                tokens[2]
            )));
        }
        if length == 0 {
            return Err(ConfigError::MalformedTable("length must be > 0".into()));
        }

        Ok(Self {
            begin,
            length,
            target: tokens[2].to_string(),
            args: tokens[3..]
                .iter()
                .map(|s| Zeroizing::new(s.to_string()))
                .collect(),
        })
    }

    /// Number of target arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Parse the target arguments carried by this line.
    pub fn target_args(&self) -> Result<TargetArgs, ConfigError> {
        let args: Vec<&str> = self.args.iter().map(|arg| arg.as_str()).collect();
        TargetArgs::parse(&args)
    }
}

impl fmt::Debug for TableLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<&str> = self
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| if i == KEY_ARG { "<redacted>" } else { arg.as_str() })
            .collect();
        f.debug_struct("TableLine")
            .field("begin", &self.begin)
            .field("length", &self.length)
            .field("target", &self.target)
            .field("args", &args)
            .finish()
    }
}

// =============================================================================
// Target Arguments
// =============================================================================

/// Parsed target arguments. The key is still hex here; turn it into
/// [`KeyMaterial`] with [`TargetArgs::key_material`].
#[derive(Clone)]
pub struct TargetArgs {
    pub mode: CipherMode,
    key_hex: Zeroizing<String>,
    pub iv_offset: u64,
    pub device_path: String,
    pub start: u64,
    pub options: MappingOptions,
}

impl TargetArgs {
    /// Parse a whitespace separated argument string.
    pub fn parse_str(args: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        Self::parse(&tokens)
    }

    pub fn parse(args: &[&str]) -> Result<Self, ConfigError> {
        if args.len() < REQUIRED_ARGS {
            return Err(ConfigError::NotEnoughArguments { got: args.len() });
        }

        let mode =
            CipherMode::from_name(args[0]).ok_or_else(|| ConfigError::InvalidCipher(args[0].into()))?;

        let key_hex = Zeroizing::new(args[1].to_string());

        let iv_offset = args[2]
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidIvOffset(args[2].into()))?;

        let device_path = args[3].to_string();

        let start = args[4]
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidStartOffset(args[4].into()))?;

        let options = parse_optional_args(&args[REQUIRED_ARGS..])?;

        Ok(Self {
            mode,
            key_hex,
            iv_offset,
            device_path,
            start,
            options,
        })
    }

    /// Decode the key into [`KeyMaterial`] for the configured mode and key type.
    pub fn key_material(&self) -> Result<KeyMaterial, ConfigError> {
        KeyMaterial::from_hex(self.mode, &self.key_hex, self.options.key_type())
    }
}

impl fmt::Debug for TargetArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetArgs")
            .field("mode", &self.mode)
            .field("key_hex", &"<redacted>")
            .field("iv_offset", &self.iv_offset)
            .field("device_path", &self.device_path)
            .field("start", &self.start)
            .field("options", &self.options)
            .finish()
    }
}

/// Parse the optional argument group, with or without a leading count.
fn parse_optional_args(args: &[&str]) -> Result<MappingOptions, ConfigError> {
    let mut options = MappingOptions::default();

    let opts = match args.first() {
        None => return Ok(options),
        Some(first) => match first.parse::<usize>() {
            Ok(count) => {
                let rest = &args[1..];
                if count != rest.len() {
                    return Err(ConfigError::InvalidFeatureArguments(format!(
                        "declared {} optional arguments, found {}",
                        count,
                        rest.len()
                    )));
                }
                rest
            }
            Err(_) => args,
        },
    };

    for opt in opts {
        match *opt {
            "allow_discards" => options.allow_discards = true,
            "iv_large_sectors" => options.iv_large_sectors = true,
            "wrappedkey_v0" => options.wrapped_key = true,
            other => match other.strip_prefix("sector_size:") {
                Some(value) => {
                    let size = value.parse::<u64>().map_err(|_| {
                        ConfigError::InvalidFeatureArguments(format!("invalid sector_size '{}'", value))
                    })?;
                    options.sector_size = Some(size);
                }
                None => return Err(ConfigError::UnrecognizedOption(other.to_string())),
            },
        }
    }

    Ok(options)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;
    use assert_matches::assert_matches;

    fn xts_key() -> String {
        "00112233445566778899aabbccddeeff".repeat(4)
    }

    #[test]
    fn test_parse_minimal_args() {
        let line = format!("aes-xts-plain64 {} 0 /dev/sda1 0", xts_key());
        let args = TargetArgs::parse_str(&line).unwrap();
        assert_eq!(args.mode, CipherMode::Aes256Xts);
        assert_eq!(args.iv_offset, 0);
        assert_eq!(args.device_path, "/dev/sda1");
        assert_eq!(args.start, 0);
        assert_eq!(args.options, MappingOptions::default());
        assert_eq!(args.key_material().unwrap().len(), 64);
    }

    #[test]
    fn test_parse_counted_options() {
        let line = format!(
            "aes-xts-plain64 {} 128 /dev/sda1 2048 3 allow_discards sector_size:4096 iv_large_sectors",
            xts_key()
        );
        let args = TargetArgs::parse_str(&line).unwrap();
        assert_eq!(args.iv_offset, 128);
        assert_eq!(args.start, 2048);
        assert!(args.options.allow_discards);
        assert!(args.options.iv_large_sectors);
        assert_eq!(args.options.sector_size, Some(4096));
    }

    #[test]
    fn test_parse_bare_options() {
        let line = format!("aes-xts-plain64 {} 0 /dev/sda1 0 wrappedkey_v0 allow_discards", xts_key());
        let args = TargetArgs::parse_str(&line).unwrap();
        assert!(args.options.wrapped_key);
        assert!(args.options.allow_discards);
        assert_eq!(args.options.key_type(), KeyType::HardwareWrapped);
    }

    #[test]
    fn test_option_count_mismatch() {
        let line = format!("aes-xts-plain64 {} 0 /dev/sda1 0 2 allow_discards", xts_key());
        assert_matches!(
            TargetArgs::parse_str(&line),
            Err(ConfigError::InvalidFeatureArguments(_))
        );
    }

    #[test]
    fn test_unknown_option() {
        let line = format!("aes-xts-plain64 {} 0 /dev/sda1 0 same_cpu_crypt", xts_key());
        assert_matches!(
            TargetArgs::parse_str(&line),
            Err(ConfigError::UnrecognizedOption(opt)) if opt == "same_cpu_crypt"
        );
    }

    #[test]
    fn test_bad_sector_size_value() {
        let line = format!("aes-xts-plain64 {} 0 /dev/sda1 0 sector_size:big", xts_key());
        assert_matches!(
            TargetArgs::parse_str(&line),
            Err(ConfigError::InvalidFeatureArguments(_))
        );
    }

    #[test]
    fn test_positional_errors() {
        assert_matches!(
            TargetArgs::parse_str("aes-xts-plain64 00 0"),
            Err(ConfigError::NotEnoughArguments { got: 3 })
        );
        assert_matches!(
            TargetArgs::parse_str("aes-cbc-plain 00 0 /dev/sda 0"),
            Err(ConfigError::InvalidCipher(_))
        );
        assert_matches!(
            TargetArgs::parse_str("aes-xts-plain64 00 -1 /dev/sda 0"),
            Err(ConfigError::InvalidIvOffset(_))
        );
        assert_matches!(
            TargetArgs::parse_str("aes-xts-plain64 00 0 /dev/sda 1x"),
            Err(ConfigError::InvalidStartOffset(_))
        );
    }

    #[test]
    fn test_table_line() {
        let line = format!("0 2048 default-key aes-xts-plain64 {} 0 /dev/sda1 0", xts_key());
        let table = TableLine::parse(&line).unwrap();
        assert_eq!(table.begin, 0);
        assert_eq!(table.length, 2048);
        assert_eq!(table.arg_count(), 5);
        assert!(table.target_args().is_ok());

        assert_matches!(
            TableLine::parse("0 2048 crypt aes-xts-plain64"),
            Err(ConfigError::MalformedTable(_))
        );
        assert_matches!(TableLine::parse("x 2048 default-key"), Err(ConfigError::MalformedTable(_)));
        assert_matches!(TableLine::parse("0 0 default-key"), Err(ConfigError::MalformedTable(_)));
    }

    #[test]
    fn test_debug_hides_key() {
        let line = format!("aes-xts-plain64 {} 0 /dev/sda1 0", xts_key());
        let args = TargetArgs::parse_str(&line).unwrap();
        let rendered = format!("{:?}", args);
        assert!(!rendered.contains(&xts_key()));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_table_line_debug_hides_key() {
        let line = format!(
            "0 2048 default-key aes-xts-plain64 {} 0 /dev/sda1 0 1 allow_discards",
            xts_key()
        );
        let table = TableLine::parse(&line).unwrap();
        for rendered in [format!("{:?}", table), format!("{:#?}", table.clone())] {
            assert!(!rendered.contains(&xts_key()));
            assert!(rendered.contains("<redacted>"));
            assert!(rendered.contains("/dev/sda1"));
        }
    }
}
