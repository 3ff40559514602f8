// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use serde::{Deserialize, Serialize};

///
/// A fully-qualified target name: `cell//path/to/package:name`. The cell prefix is empty for
/// targets in the root cell (`//path/to/package:name`).
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TargetLabel {
    pub cell: Option<String>,
    pub package: String,
    pub name: String,
}

impl TargetLabel {
    pub fn new(cell: Option<&str>, package: &str, name: &str) -> TargetLabel {
        TargetLabel {
            cell: cell.map(str::to_owned),
            package: package.to_owned(),
            name: name.to_owned(),
        }
    }

    ///
    /// The basename used for `last` output links: the target name itself.
    ///
    pub fn basename(&self) -> &str {
        &self.name
    }

    pub fn parse(s: &str) -> Result<TargetLabel, String> {
        let pattern = parse_target_pattern(s)?;
        match pattern.wildcard {
            None => Ok(pattern.label),
            Some(_) => Err(format!(
                "Expected a single target but got the pattern `{s}`."
            )),
        }
    }
}

impl fmt::Display for TargetLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}//{}:{}",
            self.cell.as_deref().unwrap_or(""),
            self.package,
            self.name
        )
    }
}

///
/// The `:` and `::` suffixes of a target pattern. `Package` selects every target of one package,
/// `Recursive` every target under a directory.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wildcard {
    Package,
    Recursive,
}

///
/// A parsed command-line target pattern: either a literal target, or a package/recursive
/// wildcard.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetPattern {
    pub label: TargetLabel,
    pub wildcard: Option<Wildcard>,
}

peg::parser! {
    grammar parsers() for str {
        rule cell_name() -> &'input str
            = s:$(['a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-']+) { s }

        rule package() -> &'input str
            = s:$(([^':'])*) { s }

        rule target_name() -> &'input str
            = quiet!{ s:$([^':']+) { s } }
            / expected!("a non-empty target name to follow a `:`.")

        rule target() -> &'input str =
          // NB: We use `&[_]` to differentiate from a wildcard by ensuring that a non-EOF
          // character follows the `:`.
          ":" &[_] s:target_name() { s }

        rule wildcard() -> Wildcard
            = "::" { Wildcard::Recursive }
            / ":" { Wildcard::Package }

        pub(crate) rule pattern() -> (Option<&'input str>, &'input str, Option<&'input str>, Option<Wildcard>)
            = cell:cell_name()? "//" package:package() target:target()? wildcard:wildcard()? {
                (cell, package, target, wildcard)
            }
    }
}

///
/// Parse a command-line target pattern. A bare `cell//path` with no target name and no wildcard
/// means the target named after the last path segment, matching the usual shorthand.
///
pub fn parse_target_pattern(value: &str) -> Result<TargetPattern, String> {
    let (cell, package, target, wildcard) = parsers::pattern(value)
        .map_err(|e| format!("Failed to parse target pattern `{value}`: {e}"))?;
    let cell = cell.filter(|c| !c.is_empty());

    if let Some(wildcard) = wildcard {
        return Ok(TargetPattern {
            label: TargetLabel::new(cell, package, ""),
            wildcard: Some(wildcard),
        });
    }

    let name = match target {
        Some(name) => name,
        None => package
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                format!("Target pattern `{value}` has no target name and no package to infer one from.")
            })?,
    };
    Ok(TargetPattern {
        label: TargetLabel::new(cell, package, name),
        wildcard: None,
    })
}
