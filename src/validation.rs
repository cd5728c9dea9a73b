//! Checks on the metadata a storlet or dependency object is registered with

use crate::errors::ValidationError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

fn check_mandatory(params: &BTreeMap<String, String>, mandatory: &[&str]) -> Result<(), ValidationError> {
    match mandatory.iter().find(|key| !params.contains_key(**key)) {
        Some(key) => Err(ValidationError::MissingParameter(key.to_string())),
        None => Ok(()),
    }
}

/// Object names usable as files inside the sandbox
pub fn is_valid_object_name(name: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9]+[a-zA-Z0-9_\.\-]*$").unwrap();
    }
    RE.is_match(name)
}

fn check_python(params: &BTreeMap<String, String>, name: &str) -> Result<(), ValidationError> {
    let version: f64 = match params.get("Language-Version") {
        Some(version) => version
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidLanguageVersion)?,
        None => 3.0,
    };
    if version.trunc() != 3.0 {
        Err(ValidationError::UnsupportedLanguageVersion)?
    }

    let module = name
        .strip_suffix(".py")
        .ok_or(ValidationError::InvalidName)?;
    let main = &params["Main"];
    if !main.starts_with(&format!("{}.", module)) {
        Err(ValidationError::MainNotInStorlet)?
    }
    if main.split('.').count() != 2 {
        Err(ValidationError::SubmoduleNotSupported)?
    }
    Ok(())
}

pub fn validate_storlet_registration(
    params: &BTreeMap<String, String>,
    name: &str,
) -> Result<(), ValidationError> {
    check_mandatory(params, &["Language", "Interface-Version", "Object-Metadata", "Main"])?;
    if !is_valid_object_name(name) {
        Err(ValidationError::InvalidName)?
    }

    match params["Language"].to_lowercase().as_str() {
        "java" => {
            if !name.contains('-') || !name.contains('.') {
                Err(ValidationError::InvalidName)?
            }
        }
        "python" => check_python(params, name)?,
        "native" => {}
        _ => Err(ValidationError::UnsupportedLanguage)?,
    }

    if let Some(deps) = params.get("Dependency").filter(|deps| !deps.is_empty()) {
        let deps: Vec<&str> = deps.split(',').map(str::trim).collect();
        if deps.contains(&name) {
            Err(ValidationError::DependencyNamedAsStorlet)?
        }
        let unique: BTreeSet<&str> = deps.iter().cloned().collect();
        if unique.len() != deps.len() {
            Err(ValidationError::DuplicatedDependency)?
        }
    }
    Ok(())
}

pub fn validate_dependency_registration(
    params: &BTreeMap<String, String>,
    name: &str,
) -> Result<(), ValidationError> {
    check_mandatory(params, &["Dependency-Version"])?;
    if !is_valid_object_name(name) {
        Err(ValidationError::InvalidName)?
    }
    if let Some(perm) = params.get("Dependency-Permissions") {
        let mode = u32::from_str_radix(perm.trim(), 8)
            .map_err(|_| ValidationError::InvalidPermission)?;
        if mode & 0o600 != 0o600 {
            Err(ValidationError::OwnerNeedsReadWrite)?
        }
    }
    Ok(())
}
