//! Route Table
//!
//! Routes sorted by priority (highest first, declaration order kept among
//! equals). The first route whose filters all pass wins.

use std::cmp::Reverse;
use std::collections::HashSet;

use tracing::debug;

use super::Filter;
use crate::config::{ConfigError, DestinationMapping, RouteSpec};
use crate::remote::InboundMessage;

/// A compiled route
#[derive(Debug, Clone)]
pub struct Route {
    name: String,
    priority: i32,
    filters: Vec<Filter>,
    mapping: DestinationMapping,
}

impl Route {
    fn compile(spec: RouteSpec) -> Result<Self, ConfigError> {
        let context = format!("route '{}'", spec.name);
        let filters = spec
            .filters
            .iter()
            .map(|filter| Filter::from_spec(filter, &context))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: spec.name,
            priority: spec.priority,
            filters,
            mapping: spec.mapping,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn mapping(&self) -> &DestinationMapping {
        &self.mapping
    }

    /// All filters pass; an empty filter list always matches
    #[inline]
    pub fn matches(&self, msg: &InboundMessage) -> bool {
        self.filters.iter().all(|filter| filter.matches(msg))
    }
}

/// Immutable, priority-ordered route table
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Validate, sort and compile the given routes
    pub fn new(mut specs: Vec<RouteSpec>) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::Validation(
                "at least one route is required".to_string(),
            ));
        }

        let mut names = HashSet::with_capacity(specs.len());
        for spec in &specs {
            if spec.name.is_empty() {
                return Err(ConfigError::Validation(
                    "route name must not be empty".to_string(),
                ));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate route name '{}'",
                    spec.name
                )));
            }
            if spec.mapping.destination_template.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "route '{}': mapping.destinationTemplate must not be empty",
                    spec.name
                )));
            }
        }

        // Stable: equal priorities keep declaration order
        specs.sort_by_key(|spec| Reverse(spec.priority));

        let routes = specs
            .into_iter()
            .map(Route::compile)
            .collect::<Result<Vec<_>, _>>()?;

        for route in &routes {
            debug!(
                "Route '{}': priority={} filters={} -> {}",
                route.name,
                route.priority,
                route.filters.len(),
                route.mapping.destination_template
            );
        }

        Ok(Self { routes })
    }

    /// First route, in priority order, whose filters all pass
    pub fn find_route(&self, msg: &InboundMessage) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(msg))
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Routes in evaluation order
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
