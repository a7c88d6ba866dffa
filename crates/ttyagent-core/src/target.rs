//! Validated exec targets.

/// A target validation failure. Display strings are surfaced (with a
/// trailing period added by the HTTP layer) in 400 responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("namespace is required")]
    MissingNamespace,
    #[error("pod is required")]
    MissingPod,
    #[error("container must not be empty")]
    EmptyContainer,
    #[error("command must be a non-empty list of non-empty strings")]
    InvalidCommand,
}

/// The `(namespace, pod, container?, command?)` tuple identifying which
/// container to exec into. All fields are trimmed; a present `command`
/// disables shell-candidate fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub command: Option<Vec<String>>,
}

impl ExecTarget {
    pub fn new(
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Option<&[String]>,
    ) -> Result<Self, TargetError> {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            return Err(TargetError::MissingNamespace);
        }
        let pod = pod.trim();
        if pod.is_empty() {
            return Err(TargetError::MissingPod);
        }
        let container = match container {
            Some(container) => {
                let container = container.trim();
                if container.is_empty() {
                    return Err(TargetError::EmptyContainer);
                }
                Some(container.to_string())
            }
            None => None,
        };
        let command = match command {
            Some(command) => {
                if command.is_empty() {
                    return Err(TargetError::InvalidCommand);
                }
                let mut argv = Vec::with_capacity(command.len());
                for arg in command {
                    let arg = arg.trim();
                    if arg.is_empty() {
                        return Err(TargetError::InvalidCommand);
                    }
                    argv.push(arg.to_string());
                }
                Some(argv)
            }
            None => None,
        };
        Ok(Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_all_fields() {
        let target = ExecTarget::new(
            "  default ",
            " my-pod\n",
            Some(" main "),
            Some(&["  /bin/ls ".to_string(), "-l".to_string()]),
        )
        .unwrap();
        assert_eq!(target.namespace, "default");
        assert_eq!(target.pod, "my-pod");
        assert_eq!(target.container.as_deref(), Some("main"));
        assert_eq!(
            target.command,
            Some(vec!["/bin/ls".to_string(), "-l".to_string()])
        );
    }

    #[test]
    fn container_and_command_are_optional() {
        let target = ExecTarget::new("default", "my-pod", None, None).unwrap();
        assert!(target.container.is_none());
        assert!(target.command.is_none());
    }

    #[test]
    fn blank_namespace_rejected() {
        assert_eq!(
            ExecTarget::new("  ", "pod", None, None),
            Err(TargetError::MissingNamespace)
        );
    }

    #[test]
    fn blank_pod_rejected() {
        assert_eq!(
            ExecTarget::new("ns", "\t", None, None),
            Err(TargetError::MissingPod)
        );
    }

    #[test]
    fn blank_container_rejected() {
        assert_eq!(
            ExecTarget::new("ns", "pod", Some(" "), None),
            Err(TargetError::EmptyContainer)
        );
    }

    #[test]
    fn empty_command_rejected() {
        assert_eq!(
            ExecTarget::new("ns", "pod", None, Some(&[])),
            Err(TargetError::InvalidCommand)
        );
        assert_eq!(
            ExecTarget::new("ns", "pod", None, Some(&["sh".to_string(), "".to_string()])),
            Err(TargetError::InvalidCommand)
        );
    }
}
