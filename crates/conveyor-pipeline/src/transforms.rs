//! `${name}` expansion for step commands.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use conveyor_exec::{CommandSpec, EnvironmentSpec};
use conveyor_types::RunId;
use regex::{Captures, Regex};

use crate::definition::PipelineDefinition;

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.-]+)\}").unwrap())
}

/// Expand `${variable}` patterns in a string.
///
/// Replaces each occurrence of `${key}` with the corresponding value from `vars`.
/// Variables that do not appear in `vars` are left as-is. Substituted values
/// are not expanded again.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    variable_re()
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Build the variable set for one stage. Later sources win:
/// definition parameters, environment variables, `endpoint.<name>`, extra
/// caller-supplied variables, then the built-ins `RUN_ID`, `PIPELINE`, `STAGE`.
pub fn template_vars(
    definition: &PipelineDefinition,
    environment: &EnvironmentSpec,
    endpoints: &BTreeMap<String, String>,
    extra: &HashMap<String, String>,
    run_id: RunId,
    stage: Option<&str>,
) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = definition
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    vars.extend(environment.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars.extend(
        endpoints
            .iter()
            .map(|(name, url)| (format!("endpoint.{}", name), url.clone())),
    );
    vars.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars.insert("RUN_ID".into(), run_id.to_string());
    vars.insert("PIPELINE".into(), definition.name.clone());
    if let Some(stage) = stage {
        vars.insert("STAGE".into(), stage.to_string());
    }
    vars
}

/// Expand the command text, working directory and step variables of a command.
pub fn expand_command(command: &CommandSpec, vars: &HashMap<String, String>) -> CommandSpec {
    CommandSpec {
        run: expand_variables(&command.run, vars),
        shell: command.shell.clone(),
        working_dir: command
            .working_dir
            .as_ref()
            .map(|dir| expand_variables(&dir.to_string_lossy(), vars).into()),
        env: command
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_variables(v, vars)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_known_variables() {
        let out = expand_variables(
            "docker push ${REGISTRY}/app:${TAG}",
            &vars(&[("REGISTRY", "ghcr.io/acme"), ("TAG", "1.2.0")]),
        );
        assert_eq!(out, "docker push ghcr.io/acme/app:1.2.0");
    }

    #[test]
    fn unknown_variables_are_left_alone() {
        let out = expand_variables("echo ${MISSING} $HOME ${", &vars(&[]));
        assert_eq!(out, "echo ${MISSING} $HOME ${");
    }

    #[test]
    fn values_are_not_re_expanded() {
        let out = expand_variables("${A}", &vars(&[("A", "${B}"), ("B", "boom")]));
        assert_eq!(out, "${B}");
    }

    #[test]
    fn dotted_endpoint_names() {
        let out = expand_variables(
            "sonar-scanner -Dsonar.host.url=${endpoint.sonar}",
            &vars(&[("endpoint.sonar", "https://sonar.internal")]),
        );
        assert_eq!(out, "sonar-scanner -Dsonar.host.url=https://sonar.internal");
    }

    #[test]
    fn template_vars_layers_sources() {
        let mut def = PipelineDefinition::from_json_str(
            r#"{"name": "web", "stages": [{"name": "Build", "steps": [{"name": "x", "run": "true"}]}]}"#,
        )
        .unwrap();
        def.parameters.insert("TAG".into(), "param".into());
        def.parameters.insert("REGION".into(), "eu".into());

        let mut env = EnvironmentSpec::default();
        env.variables.insert("TAG".into(), "env".into());
        let mut endpoints = BTreeMap::new();
        endpoints.insert("registry".into(), "https://registry.local".into());

        let vars = template_vars(&def, &env, &endpoints, &HashMap::new(), RunId(12), Some("Build"));
        assert_eq!(vars["TAG"], "env");
        assert_eq!(vars["REGION"], "eu");
        assert_eq!(vars["endpoint.registry"], "https://registry.local");
        assert_eq!(vars["RUN_ID"], "12");
        assert_eq!(vars["PIPELINE"], "web");
        assert_eq!(vars["STAGE"], "Build");
    }

    #[test]
    fn expand_command_touches_run_dir_and_env() {
        let mut command = CommandSpec::new("make ${TARGET}");
        command.working_dir = Some("services/${SERVICE}".into());
        command.env.insert("OUT".into(), "build/${TARGET}".into());

        let expanded = expand_command(&command, &vars(&[("TARGET", "release"), ("SERVICE", "api")]));
        assert_eq!(expanded.run, "make release");
        assert_eq!(expanded.working_dir.unwrap(), std::path::PathBuf::from("services/api"));
        assert_eq!(expanded.env["OUT"], "build/release");
    }
}
