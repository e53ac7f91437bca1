//! Auto-generated safety fields. Safety is injected deterministically rather
//! than left to an LLM to remember: rollback from a VCS-revert template plus
//! affected-service restarts, verification from test + health probes, health
//! checks from per-service endpoint strings.

use std::collections::BTreeSet;

use governance::paths::match_pattern;

const SERVICE_PATTERNS: &[(&str, &[&str])] = &[
    ("core-api", &["apps/core-api/**"]),
    ("agent-worker", &["apps/agent-worker/**"]),
    ("web-console", &["apps/web-console/**"]),
    ("memory", &["packages/memory/**"]),
    ("governance", &["packages/governance/**"]),
];

const HEALTH_ENDPOINTS: &[(&str, &str)] = &[
    ("core-api", "GET /health returns 200"),
    ("agent-worker", "agent-worker responds to health check"),
    ("web-console", "web-console loads without errors"),
    ("memory", "memory.list_facts() works"),
    ("governance", "governance.list_plans() works"),
];

const DB_PATTERNS: &[&str] = &["**/migrations/**", "**/schema.py", "**/alembic/**", "**/*.sql"];

#[derive(Default)]
pub struct RiskShaper;

impl RiskShaper {
    pub fn new() -> Self {
        Self
    }

    /// Rollback plan: VCS revert, service restarts, DB rollback when schema
    /// paths are touched.
    pub fn generate_rollback_plan(&self, affected_paths: &[String]) -> String {
        let mut steps = vec!["git revert <commit>".to_string()];

        let services = self.detect_services(affected_paths);
        if !services.is_empty() {
            steps.push(format!(
                "Restart services: {}",
                services.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if self.affects_database(affected_paths) {
            steps.push("Rollback database migration (if applied)".to_string());
        }

        steps.join(" && ")
    }

    /// Verification plan: tests, service health probes, manual UI check for
    /// frontend paths.
    pub fn generate_verification_plan(&self, affected_paths: &[String]) -> String {
        let mut steps = vec!["Run affected tests".to_string()];

        let services = self.detect_services(affected_paths);
        if !services.is_empty() {
            steps.push(format!(
                "Check {} health endpoints",
                services.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if self.affects_ui(affected_paths) {
            steps.push("Manual UI verification in browser".to_string());
        }

        steps.join("; ")
    }

    /// One endpoint string per affected service, plus a database connectivity
    /// check when schema paths are touched.
    pub fn generate_health_checks(&self, affected_paths: &[String]) -> Vec<String> {
        let mut checks = Vec::new();
        for service in self.detect_services(affected_paths) {
            if let Some((_, endpoint)) = HEALTH_ENDPOINTS.iter().find(|(name, _)| *name == service) {
                checks.push(endpoint.to_string());
            }
        }
        if self.affects_database(affected_paths) {
            checks.push("Database queries succeed".to_string());
        }
        checks
    }

    fn detect_services(&self, paths: &[String]) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for path in paths {
            for (service, patterns) in SERVICE_PATTERNS {
                if patterns.iter().any(|p| match_pattern(path, p)) {
                    out.insert(service.to_string());
                }
            }
        }
        out
    }

    fn affects_database(&self, paths: &[String]) -> bool {
        paths
            .iter()
            .any(|p| DB_PATTERNS.iter().any(|pat| match_pattern(p, pat)))
    }

    fn affects_ui(&self, paths: &[String]) -> bool {
        paths.iter().any(|p| {
            p.starts_with("apps/web-console/")
                || p.ends_with(".tsx")
                || p.ends_with(".jsx")
                || p.ends_with(".vue")
                || p.ends_with(".svelte")
        })
    }
}
