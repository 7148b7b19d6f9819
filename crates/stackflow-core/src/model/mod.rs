//! モデル定義
//!
//! StackFlowで使用されるデータモデルを定義します。

mod resource;
mod stack;

// Re-exports
pub use resource::*;
pub use stack::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use std::path::PathBuf;

    fn stack(name: &str, parent: Option<&str>) -> StackDescriptor {
        StackDescriptor {
            parent: parent.map(str::to_string),
            ..StackDescriptor::new(name, StackKind::Application, "application", PathBuf::from("x.yaml"))
        }
    }

    #[test]
    fn test_stacks_map_insert_and_children() {
        let mut stacks = StacksMap::new();
        stacks.insert(stack("infra", None)).unwrap();
        stacks.insert(stack("api", Some("infra"))).unwrap();
        stacks.insert(stack("web", Some("infra"))).unwrap();

        assert_eq!(stacks.len(), 3);
        assert_eq!(stacks.children_of("infra"), vec!["api", "web"]);
        assert!(stacks.get("missing").is_none());
    }

    #[test]
    fn test_stacks_map_rejects_duplicates() {
        let mut stacks = StacksMap::new();
        stacks.insert(stack("api", None)).unwrap();
        let err = stacks.insert(stack("api", None)).unwrap_err();
        assert!(matches!(err, crate::error::ConfigError::DuplicateStack { .. }));
    }

    #[test]
    fn test_find_declared_resource() {
        let mut infra = StackDescriptor::new(
            "infra",
            StackKind::Infrastructure,
            "infrastructure",
            PathBuf::from("infra.yaml"),
        );
        infra.resources.push(ResourceDefinition::new(
            "db",
            "postgres",
            "infra",
            Document::Null,
        ));

        assert!(infra.resource("db").is_some());
        assert!(infra.resource("cache").is_none());
        assert!(infra.template("web").is_none());
    }
}
