//! Layer detection and the allowed-edge matrix
//!
//! Projects follow `src/modules/<module>/<layer>/…` with shared trees under
//! `src/db`, `src/config`, `src/errors`, and `src/middleware`. The matrix
//! encodes which layer-to-layer imports are legal; module isolation is
//! enforced separately on top of it.

use serde::{Deserialize, Serialize};

/// Architectural layer of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Controller,
    Service,
    Repository,
    Schema,
    Dto,
    Entity,
    Middleware,
    Tests,
    Db,
    Config,
    Errors,
    SharedMiddleware,
    Other,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Controller => "controller",
            Self::Service => "service",
            Self::Repository => "repository",
            Self::Schema => "schema",
            Self::Dto => "dto",
            Self::Entity => "entity",
            Self::Middleware => "middleware",
            Self::Tests => "tests",
            Self::Db => "db",
            Self::Config => "config",
            Self::Errors => "errors",
            Self::SharedMiddleware => "shared_middleware",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Module layer subdirectories, in canonical order. Used for correction
/// scoping and structural-reset scaffolding.
pub const CANONICAL_LAYER_DIRS: &[&str] = &[
    "controller",
    "dto",
    "repository",
    "schema",
    "service",
    "tests",
];

/// Where a file sits in the architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlacement {
    /// Module name for files under `src/modules/<module>/…`.
    pub module: Option<String>,
    pub layer: Layer,
}

/// Classify a project-relative POSIX path.
pub fn placement(path: &str) -> FilePlacement {
    let parts: Vec<&str> = path.split('/').collect();

    if parts.first() != Some(&"src") {
        return FilePlacement {
            module: None,
            layer: Layer::Other,
        };
    }

    if parts.get(1) == Some(&"modules") {
        let module = parts.get(2).map(|m| m.to_string());
        let layer = match parts.get(3).copied() {
            Some("controller") => Layer::Controller,
            Some("service") => Layer::Service,
            Some("repository") => Layer::Repository,
            Some("schema") => Layer::Schema,
            Some("dto") => Layer::Dto,
            Some("entity") => Layer::Entity,
            Some("middleware") => Layer::Middleware,
            Some("tests") => Layer::Tests,
            _ => Layer::Other,
        };
        return FilePlacement { module, layer };
    }

    let layer = match parts.get(1).copied() {
        Some("db") => Layer::Db,
        Some("config") => Layer::Config,
        Some("errors") => Layer::Errors,
        Some("middleware") => Layer::SharedMiddleware,
        Some("tests") => Layer::Tests,
        _ => Layer::Other,
    };
    FilePlacement {
        module: None,
        layer,
    }
}

/// The allowed `(source layer → target layer)` edges, same-module.
/// Cross-module edges are handled by module isolation, not this matrix.
pub fn edge_allowed(from: Layer, to: Layer) -> bool {
    use Layer::*;
    match from {
        Controller => matches!(
            to,
            Service | Schema | Dto | Entity | Errors | Config | Middleware | SharedMiddleware
        ),
        // Same-module service composition is legal; cross-module service
        // imports are rejected by module isolation, not the matrix.
        Service => matches!(to, Service | Repository | Schema | Dto | Entity | Errors | Config),
        Repository => matches!(to, Db | Schema | Dto | Entity | Errors | Config),
        Schema => matches!(to, Dto | Entity),
        Dto => matches!(to, Entity),
        Entity => false,
        Middleware => matches!(to, Schema | Dto | Errors | Config),
        // Tests exercise anything within their module plus shared trees.
        Tests => true,
        Db => matches!(to, Config | Errors),
        Config => matches!(to, Errors),
        Errors => matches!(to, Config),
        SharedMiddleware => matches!(to, Errors | Config),
        Other => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_layer_detection() {
        let p = placement("src/modules/project/service/project-service.ts");
        assert_eq!(p.module.as_deref(), Some("project"));
        assert_eq!(p.layer, Layer::Service);

        let p = placement("src/modules/user/controller/user-controller.ts");
        assert_eq!(p.module.as_deref(), Some("user"));
        assert_eq!(p.layer, Layer::Controller);
    }

    #[test]
    fn test_shared_tree_detection() {
        assert_eq!(placement("src/db/client.ts").layer, Layer::Db);
        assert_eq!(placement("src/config/env.ts").layer, Layer::Config);
        assert_eq!(placement("src/errors/errorHandler.ts").layer, Layer::Errors);
        assert_eq!(
            placement("src/middleware/auth.ts").layer,
            Layer::SharedMiddleware
        );
        assert_eq!(placement("src/app.ts").layer, Layer::Other);
        assert_eq!(placement("package.json").layer, Layer::Other);
    }

    #[test]
    fn test_matrix_core_rules() {
        // Allowed downward edges
        assert!(edge_allowed(Layer::Controller, Layer::Service));
        assert!(edge_allowed(Layer::Service, Layer::Repository));
        assert!(edge_allowed(Layer::Repository, Layer::Db));

        // Forbidden upward / skip edges
        assert!(!edge_allowed(Layer::Repository, Layer::Service));
        assert!(!edge_allowed(Layer::Db, Layer::Service));
        assert!(!edge_allowed(Layer::Controller, Layer::Db));
        assert!(!edge_allowed(Layer::Service, Layer::Controller));
    }

    #[test]
    fn test_canonical_layer_dirs_sorted() {
        let mut sorted = CANONICAL_LAYER_DIRS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, CANONICAL_LAYER_DIRS);
    }
}
