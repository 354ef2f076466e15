//! YAML configuration loader with validation.
//!
//! Reads every `*.yaml`/`*.yml` file of a configuration directory in
//! lexicographic order, merges the documents and builds the service
//! graph. Validates:
//! - service, action and dependency uniqueness,
//! - dependency targets exist (sibling scope first inside groups),
//! - the dependency graph is acyclic,
//! - `retry` only appears together with a `delay`,
//! - variable-free node-set expressions parse.

mod format;

pub use format::{ActionDoc, ConfigDoc, ServiceDoc};

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::entity::{DepKind, IllegalDependencyKind};
use crate::graph::{Action, ActionId, GraphError, Service, ServiceGraph, ServiceId};
use crate::nodeset::{NodeSet, NodeSetParseError};
use crate::variables::VariableError;

/// Errors raised while loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad syntax in {path:?}: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path:?}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    DependencyKind(#[from] IllegalDependencyKind),

    #[error("unknown dependency {target:?} referenced by {dependent:?}")]
    UnknownDependency { dependent: String, target: String },

    #[error("action {action:?}: retry requires a nonzero delay")]
    RetryWithoutDelay { action: String },

    #[error("invalid node set {expr:?} on {entity:?}: {source}")]
    NodeSet {
        entity: String,
        expr: String,
        #[source]
        source: NodeSetParseError,
    },
}

/// Load every YAML document of a configuration directory.
pub fn load_dir(dir: &Path) -> Result<ServiceGraph, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_owned(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect();
    paths.sort();

    let mut docs = Vec::new();
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let doc: ConfigDoc = serde_yaml::from_str(&text).map_err(|source| ConfigError::Syntax {
            path: path.clone(),
            source,
        })?;
        docs.push((path, doc));
    }
    build(docs)
}

/// Load a single inline document (tests and tooling).
pub fn load_str(text: &str) -> Result<ServiceGraph, ConfigError> {
    let path = PathBuf::from("<inline>");
    let doc: ConfigDoc = serde_yaml::from_str(text).map_err(|source| ConfigError::Syntax {
        path: path.clone(),
        source,
    })?;
    build(vec![(path, doc)])
}

/// Service dependency lists waiting for every service to exist.
struct RawDeps {
    from: ServiceId,
    group: Option<ServiceId>,
    lists: Vec<(DepKind, Vec<String>)>,
}

fn build(docs: Vec<(PathBuf, ConfigDoc)>) -> Result<ServiceGraph, ConfigError> {
    let mut graph = ServiceGraph::new();
    let mut raw_deps: Vec<RawDeps> = Vec::new();

    for (path, doc) in &docs {
        for (key, value) in &doc.variables {
            let name = string_key(key, path)?;
            graph.variables.define(name, scalar_string(value, path)?)?;
        }
    }

    for (path, doc) in &docs {
        for (key, value) in &doc.services {
            let name = string_key(key, path)?;
            let service_doc: ServiceDoc =
                serde_yaml::from_value(value.clone()).map_err(|source| ConfigError::Syntax {
                    path: path.clone(),
                    source,
                })?;
            add_service_tree(&mut graph, &name, &service_doc, None, &mut raw_deps, path)?;
        }
    }

    // Wire service dependencies now that every name resolves. Inside a
    // group, sibling names win and mark the edge internal.
    for raw in raw_deps {
        for (kind, names) in raw.lists {
            for name in names {
                let (target, internal) = resolve_dep_target(&graph, raw.group, &name)
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        dependent: graph.fullname(raw.from),
                        target: name.clone(),
                    })?;
                graph.add_service_dep(raw.from, target, kind, internal)?;
            }
        }
    }

    graph.check_cycles()?;
    Ok(graph)
}

/// Resolve a dependency name: sibling scope first inside a group, then the
/// global index.
fn resolve_dep_target(
    graph: &ServiceGraph,
    group: Option<ServiceId>,
    name: &str,
) -> Option<(ServiceId, bool)> {
    if let Some(gid) = group {
        let qualified = format!("{}.{name}", graph.fullname(gid));
        if let Some(target) = graph.service_by_name(&qualified) {
            return Some((target, true));
        }
    }
    graph.service_by_name(name).map(|target| (target, false))
}

/// Create one service (recursing into nested members) and its actions.
fn add_service_tree(
    graph: &mut ServiceGraph,
    name: &str,
    doc: &ServiceDoc,
    group: Option<ServiceId>,
    raw_deps: &mut Vec<RawDeps>,
    path: &Path,
) -> Result<ServiceId, ConfigError> {
    if !doc.services.is_empty() && !doc.actions.is_empty() {
        return Err(ConfigError::Invalid {
            path: path.to_owned(),
            message: format!("service group {name:?} cannot carry actions of its own"),
        });
    }

    let mut service = Service::new(name);
    service.desc = doc.desc.clone();
    service.target = doc.target.clone();
    service.fanout = doc.fanout;
    service.errors = doc.errors.unwrap_or(0);
    service.timeout = seconds(doc.timeout);
    service.delay = seconds(doc.delay);
    service.simulate = doc.simulate;
    service.group = group;

    if let Some(gid) = group {
        let parent = graph.service(gid);
        if service.target.is_none() {
            service.target = parent.target.clone();
        }
        if service.fanout.is_none() {
            service.fanout = parent.fanout;
        }
        if doc.errors.is_none() {
            service.errors = parent.errors;
        }
        service.simulate |= parent.simulate;
    }

    for (key, value) in &doc.variables {
        let var = string_key(key, path)?;
        service.variables.define(var, scalar_string(value, path)?)?;
    }

    if let Some(expr) = &service.target {
        validate_static_target(expr, name, path)?;
    }

    let sid = graph.add_service(service)?;

    raw_deps.push(RawDeps {
        from: sid,
        group,
        lists: vec![
            ("require".parse::<DepKind>()?, doc.require.clone()),
            ("require_weak".parse::<DepKind>()?, doc.require_weak.clone()),
            ("check".parse::<DepKind>()?, doc.check.clone()),
        ],
    });

    for (key, value) in &doc.services {
        let member_name = string_key(key, path)?;
        let member_doc: ServiceDoc =
            serde_yaml::from_value(value.clone()).map_err(|source| ConfigError::Syntax {
                path: path.to_owned(),
                source,
            })?;
        add_service_tree(graph, &member_name, &member_doc, Some(sid), raw_deps, path)?;
    }

    let mut action_requires: Vec<(ActionId, Vec<String>)> = Vec::new();
    for (key, value) in &doc.actions {
        let action_name = string_key(key, path)?;
        let action_doc: ActionDoc =
            serde_yaml::from_value(value.clone()).map_err(|source| ConfigError::Syntax {
                path: path.to_owned(),
                source,
            })?;
        let aid = add_action(graph, sid, &action_name, &action_doc, path)?;
        if !action_doc.require.is_empty() {
            action_requires.push((aid, action_doc.require.clone()));
        }
    }

    for (aid, requires) in action_requires {
        for dep_name in requires {
            let target = graph.find_action(sid, &dep_name).ok_or_else(|| {
                ConfigError::UnknownDependency {
                    dependent: graph.action_label(aid),
                    target: dep_name.clone(),
                }
            })?;
            graph.add_action_dep(aid, target, DepKind::Require)?;
        }
    }

    Ok(sid)
}

fn add_action(
    graph: &mut ServiceGraph,
    sid: ServiceId,
    name: &str,
    doc: &ActionDoc,
    path: &Path,
) -> Result<ActionId, ConfigError> {
    let parent = graph.service(sid).clone();

    let mut action = Action::new(name, sid);
    action.command = doc.cmd.clone();
    action.target = doc.target.clone().or_else(|| parent.target.clone());
    action.timeout = doc.timeout.map(seconds_value).unwrap_or(parent.timeout);
    action.delay = doc.delay.map(seconds_value).unwrap_or(parent.delay);
    action.errors = doc.errors.unwrap_or(parent.errors);
    action.fanout = doc.fanout.or(parent.fanout);
    action.simulate = parent.simulate;

    for (key, value) in &doc.variables {
        let var = string_key(key, path)?;
        action.variables.define(var, scalar_string(value, path)?)?;
    }

    if let Some(retry) = doc.retry {
        action
            .set_retry(retry)
            .map_err(|_| ConfigError::RetryWithoutDelay {
                action: format!("{}.{name}", graph.fullname(sid)),
            })?;
    }

    if let Some(expr) = &action.target {
        validate_static_target(expr, &format!("{}.{name}", graph.fullname(sid)), path)?;
    }

    Ok(graph.add_action(action)?)
}

/// Variable-free targets must parse at load time; expressions with
/// `%{...}` are only checkable at dispatch.
fn validate_static_target(expr: &str, entity: &str, _path: &Path) -> Result<(), ConfigError> {
    if expr.contains("%{") {
        return Ok(());
    }
    NodeSet::parse(expr)
        .map(|_| ())
        .map_err(|source| ConfigError::NodeSet {
            entity: entity.to_owned(),
            expr: expr.to_owned(),
            source,
        })
}

fn seconds(value: Option<f64>) -> Duration {
    value.map(seconds_value).unwrap_or(Duration::ZERO)
}

fn seconds_value(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

fn string_key(key: &serde_yaml::Value, path: &Path) -> Result<String, ConfigError> {
    key.as_str()
        .map(str::to_owned)
        .ok_or_else(|| ConfigError::Invalid {
            path: path.to_owned(),
            message: format!("expected a string key, got {key:?}"),
        })
}

fn scalar_string(value: &serde_yaml::Value, path: &Path) -> Result<String, ConfigError> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConfigError::Invalid {
            path: path.to_owned(),
            message: format!("expected a scalar value, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Status;

    #[test]
    fn builds_linear_graph() {
        let graph = load_str(
            r#"
services:
  network:
    actions:
      start: {cmd: net-up}
  nfs:
    require: [network]
    actions:
      start: {cmd: nfs-up}
"#,
        )
        .expect("should build");
        assert_eq!(graph.service_count(), 2);
        let nfs = graph.service_by_name("nfs").unwrap();
        let network = graph.service_by_name("network").unwrap();
        assert_eq!(graph.dep_kind(nfs, network), Some(DepKind::Require));
        assert_eq!(graph.service_status("nfs"), Some(Status::NoStatus));
    }

    #[test]
    fn action_inherits_service_settings() {
        let graph = load_str(
            r#"
services:
  nfs:
    target: "node[1-4]"
    fanout: 8
    errors: 2
    timeout: 10
    actions:
      start: {cmd: nfs-up}
      stop: {cmd: nfs-down, timeout: 3, target: node1}
"#,
        )
        .unwrap();
        let sid = graph.service_by_name("nfs").unwrap();
        let start = graph.action(graph.find_action(sid, "start").unwrap());
        assert_eq!(start.target.as_deref(), Some("node[1-4]"));
        assert_eq!(start.fanout, Some(8));
        assert_eq!(start.errors, 2);
        assert_eq!(start.timeout, Duration::from_secs(10));

        let stop = graph.action(graph.find_action(sid, "stop").unwrap());
        assert_eq!(stop.target.as_deref(), Some("node1"));
        assert_eq!(stop.timeout, Duration::from_secs(3));
    }

    #[test]
    fn nested_services_become_group_members() {
        let graph = load_str(
            r#"
services:
  db:
    services:
      mysql:
        actions:
          start: {cmd: mysql-up}
      backup:
        require: [mysql]
        actions:
          start: {cmd: backup-up}
"#,
        )
        .unwrap();
        let db = graph.service_by_name("db").unwrap();
        assert!(graph.service(db).is_group());
        let mysql = graph.service_by_name("db.mysql").unwrap();
        let backup = graph.service_by_name("db.backup").unwrap();
        assert_eq!(graph.dep_kind(backup, mysql), Some(DepKind::Require));
        // Sibling dependency resolved inside the group is internal.
        assert!(graph.service(backup).deps[0].internal);
    }

    #[test]
    fn group_with_actions_is_rejected() {
        let err = load_str(
            r#"
services:
  db:
    actions:
      start: {cmd: nope}
    services:
      mysql:
        actions:
          start: {cmd: mysql-up}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = load_str(
            r#"
services:
  nfs:
    require: [ghost]
    actions:
      start: {cmd: nfs-up}
"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::UnknownDependency { ref target, .. } if target == "ghost")
        );
    }

    #[test]
    fn duplicate_dependency_is_rejected() {
        let err = load_str(
            r#"
services:
  network:
    actions:
      start: {cmd: net-up}
  nfs:
    require: [network]
    require_weak: [network]
    actions:
      start: {cmd: nfs-up}
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Graph(GraphError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let err = load_str(
            r#"
services:
  a:
    require: [b]
    actions:
      start: {cmd: "true"}
  b:
    require: [a]
    actions:
      start: {cmd: "true"}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Graph(GraphError::Cycle(_))));
    }

    #[test]
    fn retry_without_delay_is_rejected() {
        let err = load_str(
            r#"
services:
  nfs:
    actions:
      start: {cmd: nfs-up, retry: 2}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::RetryWithoutDelay { .. }));
    }

    #[test]
    fn retry_with_service_level_delay_is_accepted() {
        let graph = load_str(
            r#"
services:
  nfs:
    delay: 2
    actions:
      start: {cmd: nfs-up, retry: 3}
"#,
        )
        .unwrap();
        let sid = graph.service_by_name("nfs").unwrap();
        let start = graph.action(graph.find_action(sid, "start").unwrap());
        assert_eq!(start.retry(), 3);
        assert_eq!(start.delay, Duration::from_secs(2));
    }

    #[test]
    fn bad_static_target_is_rejected() {
        let err = load_str(
            r#"
services:
  nfs:
    actions:
      start: {cmd: nfs-up, target: "node[1-"}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NodeSet { .. }));
    }

    #[test]
    fn variable_targets_are_deferred() {
        load_str(
            r#"
variables:
  nodes: "node[1-4]"
services:
  nfs:
    actions:
      start: {cmd: nfs-up, target: "%{nodes}"}
"#,
        )
        .expect("variable targets cannot be validated at load time");
    }

    #[test]
    fn duplicate_global_variable_is_rejected() {
        let err = load_str(
            r#"
variables:
  a: 1
  a: 2
services: {}
"#,
        )
        .unwrap_err();
        // Duplicate YAML keys are caught by either the scanner or the
        // variable scope, depending on the serde_yaml version.
        assert!(matches!(
            err,
            ConfigError::Syntax { .. } | ConfigError::Variable(VariableError::AlreadyReferenced(_))
        ));
    }

    #[test]
    fn scalar_variables_are_stringified() {
        let graph = load_str(
            r#"
variables:
  count: 4
  flag: true
services: {}
"#,
        )
        .unwrap();
        assert_eq!(graph.variables.get("count"), Some("4"));
        assert_eq!(graph.variables.get("flag"), Some("true"));
    }

    #[test]
    fn load_dir_reads_files_in_name_order() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("10-base.yaml"),
            "services:\n  network:\n    actions:\n      start: {cmd: net-up}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-nfs.yaml"),
            "services:\n  nfs:\n    require: [network]\n    actions:\n      start: {cmd: nfs-up}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let graph = load_dir(dir.path()).expect("should load directory");
        assert_eq!(graph.service_count(), 2);
        assert!(graph.service_by_name("nfs").is_some());
    }

    #[test]
    fn load_dir_surfaces_scanner_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "services: [unclosed").unwrap();
        let err = load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { .. }));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let err = load_dir(Path::new("/nonexistent/milkcheck-conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
