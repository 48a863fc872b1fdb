//! Nulconfig boot-configuration file parsing (spec.md §6).
//!
//! Each non-empty, non-comment line describes one module to boot: the
//! sigma0 half (tokens the root task itself consumes — CPU pinning, memory
//! budget, DMA grant) and the client half, separated by the two-pipe `||`
//! delimiter. The client half is `<scheme>://<path> <args...>`, where
//! `<scheme>` selects the file service (`rom`, `embedded`, ...) that will
//! resolve `<path>` to module bytes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NulconfigError {
    #[error("line {0}: missing '||' separator between sigma0 and client halves")]
    MissingSeparator(usize),
    #[error("line {0}: client half has no '<scheme>://<path>'")]
    MissingScheme(usize),
}

/// One parsed module line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Tokens the root task itself consumes (not forwarded to the client).
    pub sigma0_args: String,
    /// File-service scheme selecting how `path` is resolved (`rom`, `embedded`).
    pub scheme: String,
    /// Path within that file service.
    pub path: String,
    /// Remaining whitespace-separated client arguments, verbatim.
    pub client_args: String,
}

impl ModuleEntry {
    /// The full command line as handed to the client (`<scheme>://<path> <args>`),
    /// matching what `Module::cmdline` stores (spec.md §3).
    pub fn client_cmdline(&self) -> String {
        if self.client_args.is_empty() {
            format!("{}://{}", self.scheme, self.path)
        } else {
            format!("{}://{} {}", self.scheme, self.path, self.client_args)
        }
    }
}

fn parse_client_half(line_no: usize, client_half: &str) -> Result<(String, String, String), NulconfigError> {
    let client_half = client_half.trim();
    let (url, client_args) = match client_half.split_once(char::is_whitespace) {
        Some((url, rest)) => (url, rest.trim_start()),
        None => (client_half, ""),
    };
    let (scheme, path) = url
        .split_once("://")
        .ok_or(NulconfigError::MissingScheme(line_no))?;
    Ok((scheme.to_string(), path.to_string(), client_args.to_string()))
}

/// Parse a full Nulconfig file's contents into its module entries. Blank
/// lines and lines starting with `#` are ignored.
pub fn parse(contents: &str) -> Result<Vec<ModuleEntry>, NulconfigError> {
    let mut entries = Vec::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (sigma0_half, client_half) = line
            .split_once("||")
            .ok_or(NulconfigError::MissingSeparator(line_no))?;
        let (scheme, path, client_args) = parse_client_half(line_no, client_half)?;
        entries.push(ModuleEntry {
            sigma0_args: sigma0_half.trim().to_string(),
            scheme,
            path,
            client_args,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_module_line() {
        let entries = parse("sigma0::cpu=0 || rom://bin/timer quota::guid").unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.sigma0_args, "sigma0::cpu=0");
        assert_eq!(e.scheme, "rom");
        assert_eq!(e.path, "bin/timer");
        assert_eq!(e.client_args, "quota::guid");
        assert_eq!(e.client_cmdline(), "rom://bin/timer quota::guid");
    }

    #[test]
    fn ignores_blank_and_comment_lines() {
        let entries = parse("\n# a comment\n   \nnamespace::/s0 || rom://bin/s0\n").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_separator_is_an_error() {
        assert_eq!(parse("rom://bin/timer").unwrap_err(), NulconfigError::MissingSeparator(1));
    }

    #[test]
    fn missing_scheme_is_an_error() {
        assert_eq!(parse("|| bin/timer").unwrap_err(), NulconfigError::MissingScheme(1));
    }

    #[test]
    fn client_half_without_extra_args() {
        let entries = parse(" || embedded://disk0").unwrap();
        assert_eq!(entries[0].client_args, "");
        assert_eq!(entries[0].client_cmdline(), "embedded://disk0");
    }
}
