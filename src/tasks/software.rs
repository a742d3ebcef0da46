//! Software installation dispatched by package manager.

use std::time::Duration;

use crate::error::TaskError;
use crate::tasks::command::{CommandOutput, run_command};

/// Build and run the install command for the declared manager.
pub async fn install_software(
    manager: &str,
    package: &str,
    timeout: Duration,
) -> Result<CommandOutput, TaskError> {
    // Package names are interpolated into a shell line; refuse anything
    // that could smuggle in extra commands.
    if !is_safe_package_name(package) {
        return Err(TaskError::SecurityViolation(format!(
            "suspicious package name: {package}"
        )));
    }

    let command = install_command(manager, package)?;
    tracing::info!(manager, package, "installing software");
    run_command(&command, timeout).await
}

fn install_command(manager: &str, package: &str) -> Result<String, TaskError> {
    let command = match manager {
        "brew" => format!("brew install {package}"),
        "brew_cask" => format!("brew install --cask {package}"),
        "mas" => format!("mas install {package}"),
        "pip" => format!("pip3 install --user {package}"),
        "npm" => format!("npm install -g {package}"),
        other => return Err(TaskError::UnknownManager(other.to_string())),
    };
    Ok(command)
}

fn is_safe_package_name(package: &str) -> bool {
    !package.is_empty()
        && package.len() <= 128
        && package
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '/' | '+'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_commands() {
        assert_eq!(install_command("brew", "jq").unwrap(), "brew install jq");
        assert_eq!(
            install_command("pip", "requests").unwrap(),
            "pip3 install --user requests"
        );
        assert_eq!(
            install_command("npm", "typescript").unwrap(),
            "npm install -g typescript"
        );
    }

    #[test]
    fn test_unknown_manager() {
        assert!(matches!(
            install_command("apt-get-maybe", "jq"),
            Err(TaskError::UnknownManager(_))
        ));
    }

    #[test]
    fn test_package_name_validation() {
        assert!(is_safe_package_name("jq"));
        assert!(is_safe_package_name("@types/node"));
        assert!(is_safe_package_name("python-3.12"));
        assert!(!is_safe_package_name(""));
        assert!(!is_safe_package_name("jq; rm -rf /"));
        assert!(!is_safe_package_name("jq && curl evil"));
    }
}
