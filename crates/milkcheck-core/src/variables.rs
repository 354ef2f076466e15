//! Variable scopes and `%{name}` interpolation.
//!
//! Every entity carries an ordered name→expression scope chained to its
//! parent (action → service → global). Property strings such as commands
//! and targets are expanded against the chain at resolve time; expansion of
//! the same input against the same chain is deterministic.

use thiserror::Error;

/// Expansion depth cap; a deeper chain means the definitions are circular.
const MAX_EXPANSION_DEPTH: usize = 16;

/// Errors raised by variable binding and expansion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariableError {
    #[error("variable {0:?} is not defined")]
    Undefined(String),

    #[error("variable {0:?} is already referenced in this scope")]
    AlreadyReferenced(String),

    #[error("invalid variable expansion in {0:?}")]
    Invalid(String),
}

/// An ordered mapping of variable names to string expressions.
///
/// A scope holds its own bindings only; chaining is expressed at lookup
/// time by passing the scopes from innermost to outermost.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    vars: Vec<(String, String)>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a name in this scope. Rebinding an existing name is an error.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), VariableError> {
        let name = name.into();
        if self.vars.iter().any(|(n, _)| *n == name) {
            return Err(VariableError::AlreadyReferenced(name));
        }
        self.vars.push((name, value.into()));
        Ok(())
    }

    /// Look up a name in this scope only.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Look up `name` along a scope chain, innermost first.
fn lookup<'a>(chain: &[&'a VariableScope], name: &str) -> Result<&'a str, VariableError> {
    chain
        .iter()
        .find_map(|scope| scope.get(name))
        .ok_or_else(|| VariableError::Undefined(name.to_owned()))
}

/// Expand every `%{name}` occurrence in `input` against the scope chain.
///
/// Variable values may themselves contain `%{...}` references; expansion
/// recurses up to a fixed depth, past which the definitions are treated as
/// circular and rejected.
pub fn expand(input: &str, chain: &[&VariableScope]) -> Result<String, VariableError> {
    expand_at_depth(input, chain, 0)
}

fn expand_at_depth(
    input: &str,
    chain: &[&VariableScope],
    depth: usize,
) -> Result<String, VariableError> {
    if depth > MAX_EXPANSION_DEPTH {
        return Err(VariableError::Invalid(input.to_owned()));
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find("%{") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 2..];
        let Some(end) = tail.find('}') else {
            return Err(VariableError::Invalid(input.to_owned()));
        };
        let name = &tail[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(VariableError::Invalid(input.to_owned()));
        }
        let value = lookup(chain, name)?;
        out.push_str(&expand_at_depth(value, chain, depth + 1)?);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> VariableScope {
        let mut s = VariableScope::new();
        for (n, v) in pairs {
            s.define(*n, *v).unwrap();
        }
        s
    }

    #[test]
    fn expands_single_variable() {
        let global = scope(&[("mount", "/export")]);
        let out = expand("ls %{mount}", &[&global]).unwrap();
        assert_eq!(out, "ls /export");
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let global = scope(&[("target", "node[1-4]")]);
        let local = scope(&[("target", "node1")]);
        let out = expand("%{target}", &[&local, &global]).unwrap();
        assert_eq!(out, "node1");
    }

    #[test]
    fn falls_back_to_outer_scope() {
        let global = scope(&[("user", "admin")]);
        let local = scope(&[("cmd", "whoami")]);
        let out = expand("%{cmd} as %{user}", &[&local, &global]).unwrap();
        assert_eq!(out, "whoami as admin");
    }

    #[test]
    fn expands_nested_definitions() {
        let global = scope(&[("base", "/srv"), ("path", "%{base}/data")]);
        let out = expand("du %{path}", &[&global]).unwrap();
        assert_eq!(out, "du /srv/data");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let global = scope(&[]);
        let err = expand("%{missing}", &[&global]).unwrap_err();
        assert_eq!(err, VariableError::Undefined("missing".to_owned()));
    }

    #[test]
    fn rebinding_is_an_error() {
        let mut s = scope(&[("a", "1")]);
        let err = s.define("a", "2").unwrap_err();
        assert_eq!(err, VariableError::AlreadyReferenced("a".to_owned()));
    }

    #[test]
    fn unterminated_expansion_is_invalid() {
        let global = scope(&[("a", "1")]);
        assert!(matches!(
            expand("%{a", &[&global]),
            Err(VariableError::Invalid(_))
        ));
    }

    #[test]
    fn empty_name_is_invalid() {
        let global = scope(&[]);
        assert!(matches!(
            expand("%{}", &[&global]),
            Err(VariableError::Invalid(_))
        ));
    }

    #[test]
    fn circular_definitions_are_invalid() {
        let global = scope(&[("a", "%{b}"), ("b", "%{a}")]);
        assert!(matches!(
            expand("%{a}", &[&global]),
            Err(VariableError::Invalid(_))
        ));
    }

    #[test]
    fn expansion_is_deterministic() {
        let global = scope(&[("n", "node[1-2]")]);
        let a = expand("ping %{n}", &[&global]).unwrap();
        let b = expand("ping %{n}", &[&global]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn text_without_variables_passes_through() {
        let global = scope(&[]);
        assert_eq!(expand("echo 100%", &[&global]).unwrap(), "echo 100%");
    }
}
