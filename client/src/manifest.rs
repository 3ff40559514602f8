// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use build_graph::{
    ActionGraph, BuildRule, RawTargetNode, TargetGraph, TargetLabel, TargetPattern, Wildcard,
};
use cells::CellIndexer;
use coordinator::{ActionGraphLowerer, TargetGraphParser};

const BUILD_FILE_NAME: &str = "BUILD.toml";

///
/// One target definition as written in a BUILD.toml file. Serialized verbatim into the target
/// graph node, so the remote sees exactly what the build file said.
///
// NB: `env` must stay the last field: TOML requires tables to be emitted after values, and the
// serializer follows field order.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TargetDef {
    #[serde(rename = "type", default = "TargetDef::default_rule_type")]
    pub rule_type: String,
    #[serde(default = "TargetDef::default_cacheable")]
    pub cacheable: bool,
    /// The shell command producing the outputs, run from the cell root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Input files, relative to the package directory.
    #[serde(default)]
    pub srcs: Vec<String>,
    /// Output files, relative to the package directory.
    #[serde(default)]
    pub outs: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TargetDef {
    fn default_rule_type() -> String {
        "genrule".to_owned()
    }

    fn default_cacheable() -> bool {
        true
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFile {
    #[serde(default)]
    targets: BTreeMap<String, TargetDef>,
}

///
/// Builds target and action graphs out of BUILD.toml files under the build root (and the
/// configured cell roots).
///
pub struct ManifestGraph {
    build_root: PathBuf,
    /// Named cell roots, absolute.
    cell_roots: BTreeMap<String, PathBuf>,
    cells: Arc<CellIndexer>,
}

impl ManifestGraph {
    pub fn new(
        build_root: PathBuf,
        cell_roots: BTreeMap<String, PathBuf>,
        cells: Arc<CellIndexer>,
    ) -> ManifestGraph {
        ManifestGraph {
            build_root,
            cell_roots,
            cells,
        }
    }

    fn cell_root(&self, cell: Option<&str>) -> Result<&Path, String> {
        match cell {
            None => Ok(&self.build_root),
            Some(name) => self
                .cell_roots
                .get(name)
                .map(PathBuf::as_path)
                .ok_or_else(|| format!("Unknown cell `{name}`.")),
        }
    }

    fn package_dir(&self, label_cell: Option<&str>, package: &str) -> Result<PathBuf, String> {
        Ok(self.cell_root(label_cell)?.join(package))
    }

    fn load_build_file(
        &self,
        cell: Option<&str>,
        package: &str,
    ) -> Result<BTreeMap<String, TargetDef>, String> {
        let path = self.package_dir(cell, package)?.join(BUILD_FILE_NAME);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        let build_file: BuildFile =
            toml::from_str(&raw).map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
        Ok(build_file.targets)
    }

    ///
    /// Expand one pattern to the labels it names.
    ///
    fn expand(&self, pattern: &TargetPattern) -> Result<Vec<TargetLabel>, String> {
        let cell = pattern.label.cell.as_deref();
        match pattern.wildcard {
            None => Ok(vec![pattern.label.clone()]),
            Some(Wildcard::Package) => {
                let targets = self.load_build_file(cell, &pattern.label.package)?;
                Ok(targets
                    .keys()
                    .map(|name| TargetLabel::new(cell, &pattern.label.package, name))
                    .collect())
            }
            Some(Wildcard::Recursive) => {
                let mut labels = Vec::new();
                let root = self.package_dir(cell, &pattern.label.package)?;
                let mut directories = VecDeque::from([root.clone()]);
                while let Some(directory) = directories.pop_front() {
                    for entry in std::fs::read_dir(&directory)
                        .map_err(|e| format!("Failed to list {}: {e}", directory.display()))?
                    {
                        let entry = entry
                            .map_err(|e| format!("Failed to list {}: {e}", directory.display()))?;
                        if entry.path().is_dir() {
                            directories.push_back(entry.path());
                        }
                    }
                    if directory.join(BUILD_FILE_NAME).is_file() {
                        let relative = directory
                            .strip_prefix(self.cell_root(cell)?)
                            .map_err(|e| e.to_string())?;
                        let package = relative.to_string_lossy().replace('\\', "/");
                        labels.extend(
                            self.load_build_file(cell, &package)?
                                .keys()
                                .map(|name| TargetLabel::new(cell, &package, name)),
                        );
                    }
                }
                Ok(labels)
            }
        }
    }

    fn def_for(&self, label: &TargetLabel) -> Result<TargetDef, String> {
        let mut targets = self.load_build_file(label.cell.as_deref(), &label.package)?;
        targets.remove(&label.name).ok_or_else(|| {
            format!(
                "Unknown target {label}: {}/{BUILD_FILE_NAME} defines no target `{}`.",
                label.package, label.name
            )
        })
    }
}

impl TargetGraphParser for ManifestGraph {
    ///
    /// Expand the patterns, then pull in the transitive dep closure breadth-first. Node payloads
    /// are the raw TOML of each target definition, pre-versioning.
    ///
    fn parse(
        &self,
        patterns: &[TargetPattern],
    ) -> Result<(TargetGraph, Vec<TargetLabel>), String> {
        let mut top_level = Vec::new();
        for pattern in patterns {
            top_level.extend(self.expand(pattern)?);
        }

        let mut nodes = Vec::new();
        let mut visited: HashSet<TargetLabel> = HashSet::new();
        let mut queue: VecDeque<TargetLabel> = top_level.iter().cloned().collect();
        while let Some(label) = queue.pop_front() {
            if !visited.insert(label.clone()) {
                continue;
            }
            let def = self.def_for(&label)?;
            for dep in &def.deps {
                queue.push_back(TargetLabel::parse(dep)?);
            }
            let data = toml::to_string(&def)
                .map_err(|e| format!("Failed to render {label}: {e}"))?
                .into_bytes();
            nodes.push(RawTargetNode { label, data });
        }

        Ok((TargetGraph::new(nodes), top_level))
    }
}

impl ActionGraphLowerer for ManifestGraph {
    ///
    /// Lower the raw nodes back into BuildRules. Paths become cell-relative, and each rule's
    /// owning cell is indexed here, as the rules are traversed.
    ///
    fn lower(
        &self,
        target_graph: &TargetGraph,
        _top_level_targets: &[TargetLabel],
    ) -> Result<ActionGraph, String> {
        let mut rules = Vec::new();
        for node in target_graph.nodes() {
            let raw = std::str::from_utf8(&node.data)
                .map_err(|e| format!("Node {} is not UTF-8: {e}", node.label))?;
            let def: TargetDef = toml::from_str(raw)
                .map_err(|e| format!("Failed to parse node {}: {e}", node.label))?;

            let label = node.label.clone();
            let package_dir = self.package_dir(label.cell.as_deref(), &label.package)?;
            let cell = self.cells.index_of(&package_dir)?;
            let package_relative = |path: &String| {
                if label.package.is_empty() {
                    path.clone()
                } else {
                    format!("{}/{path}", label.package)
                }
            };

            rules.push(BuildRule {
                rule_type: def.rule_type,
                cell,
                srcs: def.srcs.iter().map(&package_relative).collect(),
                outputs: def.outs.iter().map(&package_relative).collect(),
                env: def.env,
                cmd: def.cmd,
                deps: def
                    .deps
                    .iter()
                    .map(|dep| TargetLabel::parse(dep))
                    .collect::<Result<Vec<_>, String>>()?,
                cacheable: def.cacheable,
                label,
            });
        }
        ActionGraph::new(rules)
    }
}

#[cfg(test)]
mod manifest_tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    use build_graph::{parse_target_pattern, TargetLabel};
    use cells::CellIndexer;
    use coordinator::{ActionGraphLowerer, TargetGraphParser};

    use super::ManifestGraph;

    fn write_build_file(dir: &Path, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("BUILD.toml"), content).unwrap();
    }

    fn manifest(root: &Path) -> ManifestGraph {
        ManifestGraph::new(
            root.to_path_buf(),
            BTreeMap::new(),
            Arc::new(CellIndexer::new(
                root.to_path_buf(),
                BTreeMap::new(),
                vec![],
            )),
        )
    }

    #[test]
    fn parses_dep_closure() {
        let dir = tempfile::TempDir::new().unwrap();
        write_build_file(
            &dir.path().join("app"),
            r#"
            [targets.app]
            srcs = ["main.c"]
            outs = ["app.bin"]
            deps = ["//lib:core"]
            cmd = "cc -o app.bin main.c"
            "#,
        );
        write_build_file(
            &dir.path().join("lib"),
            r#"
            [targets.core]
            srcs = ["core.c"]
            outs = ["core.a"]
            "#,
        );

        let manifest = manifest(dir.path());
        let (graph, top_level) = manifest
            .parse(&[parse_target_pattern("//app:app").unwrap()])
            .unwrap();

        assert_eq!(top_level, vec![TargetLabel::parse("//app:app").unwrap()]);
        assert_eq!(graph.len(), 2);
        assert!(graph.contains(&TargetLabel::parse("//lib:core").unwrap()));
    }

    #[test]
    fn package_wildcard_expands_all_targets() {
        let dir = tempfile::TempDir::new().unwrap();
        write_build_file(
            &dir.path().join("pkg"),
            r#"
            [targets.a]
            [targets.b]
            "#,
        );

        let (_, top_level) = manifest(dir.path())
            .parse(&[parse_target_pattern("//pkg:").unwrap()])
            .unwrap();
        assert_eq!(top_level.len(), 2);
    }

    #[test]
    fn recursive_wildcard_walks_subpackages() {
        let dir = tempfile::TempDir::new().unwrap();
        write_build_file(&dir.path().join("top"), "[targets.a]\n");
        write_build_file(&dir.path().join("top/nested"), "[targets.b]\n");

        let (_, top_level) = manifest(dir.path())
            .parse(&[parse_target_pattern("//top::").unwrap()])
            .unwrap();
        assert_eq!(top_level.len(), 2);
    }

    #[test]
    fn unknown_target_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        write_build_file(&dir.path().join("pkg"), "[targets.a]\n");

        let err = manifest(dir.path())
            .parse(&[parse_target_pattern("//pkg:missing").unwrap()])
            .unwrap_err();
        assert!(err.contains("//pkg:missing"), "unexpected error: {err}");
    }

    #[test]
    fn lowering_produces_cell_relative_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        write_build_file(
            &dir.path().join("app"),
            r#"
            [targets.app]
            srcs = ["main.c"]
            outs = ["app.bin"]
            cacheable = false
            "#,
        );

        let manifest = manifest(dir.path());
        let (graph, top_level) = manifest
            .parse(&[parse_target_pattern("//app:app").unwrap()])
            .unwrap();
        let action_graph = manifest.lower(&graph, &top_level).unwrap();

        let rule = action_graph
            .get(&TargetLabel::parse("//app:app").unwrap())
            .unwrap();
        assert_eq!(rule.srcs, vec!["app/main.c".to_owned()]);
        assert_eq!(rule.outputs, vec!["app/app.bin".to_owned()]);
        assert!(!rule.cacheable);
    }
}
