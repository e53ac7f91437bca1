//! Rule-based intent decomposition. No LLM: keyword scoring classifies the
//! intent, component detection routes tools, and a deterministic table maps the
//! result to analysis requirements and estimated risk.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    FixBug,
    AddFeature,
    Refactor,
    UpdateDocs,
    AddTest,
    Investigate,
    Optimize,
    Unknown,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::FixBug => "fix_bug",
            IntentType::AddFeature => "add_feature",
            IntentType::Refactor => "refactor",
            IntentType::UpdateDocs => "update_docs",
            IntentType::AddTest => "add_test",
            IntentType::Investigate => "investigate",
            IntentType::Optimize => "optimize",
            IntentType::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisRequirement {
    ReadCode,
    SearchPattern,
    TraceFlow,
    CheckTests,
    ReviewDocs,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecomposedIntent {
    pub original_intent: String,
    pub intent_type: IntentType,
    pub needs_analysis: bool,
    pub analysis_requirements: Vec<AnalysisRequirement>,
    pub suggested_approach: String,
    pub affected_components: Vec<String>,
    /// "low" | "medium" | "high"
    pub estimated_risk: String,
    pub analysis_tools: Vec<String>,
    pub planning_tools: Vec<String>,
}

const INTENT_KEYWORDS: &[(IntentType, &[&str])] = &[
    (
        IntentType::FixBug,
        &["fix", "bug", "broken", "error", "issue", "problem", "doesn't work", "not working", "fails"],
    ),
    (
        IntentType::AddFeature,
        &["add", "create", "implement", "build", "new feature", "support for", "enable"],
    ),
    (
        IntentType::Refactor,
        &["refactor", "restructure", "reorganize", "clean up", "improve structure", "simplify"],
    ),
    (
        IntentType::UpdateDocs,
        &["update docs", "documentation", "readme", "comment", "explain", "document"],
    ),
    (
        IntentType::AddTest,
        &["add test", "test coverage", "unit test", "integration test", "test for"],
    ),
    (
        IntentType::Investigate,
        &["investigate", "understand", "why", "how does", "debug", "trace", "explore"],
    ),
    (
        IntentType::Optimize,
        &["optimize", "performance", "speed up", "make faster", "reduce latency", "improve efficiency"],
    ),
];

const COMPONENT_KEYWORDS: &[(&str, &[&str])] = &[
    ("memory", &["memory", "facts", "proposal", "conflict"]),
    ("governance", &["governance", "writegate", "changeplan", "approval"]),
    ("agent", &["agent", "planner", "orchestrator"]),
    ("api", &["api", "endpoint", "rest", "http"]),
    ("database", &["database", "db", "schema", "migration"]),
    ("ui", &["ui", "frontend", "web-console", "interface"]),
];

#[derive(Default)]
pub struct IntentDecomposer;

impl IntentDecomposer {
    pub fn new() -> Self {
        Self
    }

    pub fn decompose(&self, user_intent: &str) -> DecomposedIntent {
        let lower = user_intent.to_lowercase();

        let intent_type = classify_intent(&lower);
        let needs_analysis = needs_analysis(intent_type, &lower);
        let analysis_requirements = if needs_analysis {
            analysis_requirements(intent_type)
        } else {
            Vec::new()
        };
        let affected_components = identify_components(&lower);
        let estimated_risk = estimate_risk(intent_type, &affected_components);

        DecomposedIntent {
            original_intent: user_intent.to_string(),
            intent_type,
            needs_analysis,
            analysis_tools: analysis_tools(&analysis_requirements),
            analysis_requirements,
            suggested_approach: suggest_approach(intent_type).to_string(),
            affected_components,
            estimated_risk,
            planning_tools: vec!["generate_diff".to_string(), "compute_checksum".to_string()],
        }
    }
}

fn classify_intent(lower: &str) -> IntentType {
    let mut best = IntentType::Unknown;
    let mut best_score = 0usize;
    for (intent, keywords) in INTENT_KEYWORDS {
        let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if score > best_score {
            best_score = score;
            best = *intent;
        }
    }
    best
}

fn identify_components(lower: &str) -> Vec<String> {
    COMPONENT_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
        .map(|(component, _)| component.to_string())
        .collect()
}

fn needs_analysis(intent_type: IntentType, lower: &str) -> bool {
    match intent_type {
        IntentType::FixBug | IntentType::Refactor | IntentType::Optimize | IntentType::Investigate => {
            true
        }
        // Features modifying existing code want analysis; pure additions don't.
        IntentType::AddFeature => ["to", "in", "for", "on"]
            .iter()
            .any(|kw| lower.split_whitespace().any(|w| w == *kw)),
        IntentType::UpdateDocs | IntentType::AddTest => false,
        IntentType::Unknown => true,
    }
}

fn analysis_requirements(intent_type: IntentType) -> Vec<AnalysisRequirement> {
    use AnalysisRequirement::*;
    match intent_type {
        IntentType::FixBug => vec![ReadCode, TraceFlow, CheckTests],
        IntentType::AddFeature => vec![ReadCode, ReviewDocs],
        IntentType::Refactor => vec![ReadCode, CheckTests],
        IntentType::Investigate => vec![ReadCode, SearchPattern, TraceFlow],
        IntentType::Optimize => vec![ReadCode, TraceFlow],
        _ => vec![ReadCode],
    }
}

fn suggest_approach(intent_type: IntentType) -> &'static str {
    match intent_type {
        IntentType::FixBug => "Identify root cause, design fix, test, apply",
        IntentType::AddFeature => "Understand requirements, design API, implement, test",
        IntentType::Refactor => "Understand current structure, design target, refactor, verify tests pass",
        IntentType::UpdateDocs => "Read existing docs, update content, verify formatting",
        IntentType::AddTest => "Identify test gaps, write test cases, verify coverage",
        IntentType::Investigate => "Read code, trace execution, document findings",
        IntentType::Optimize => "Profile performance, identify bottleneck, optimize, benchmark",
        IntentType::Unknown => "Analyze, plan, execute, verify",
    }
}

fn estimate_risk(intent_type: IntentType, components: &[String]) -> String {
    if components.iter().any(|c| c == "governance" || c == "database") {
        return "high".to_string();
    }
    match intent_type {
        IntentType::Refactor | IntentType::Optimize | IntentType::FixBug => "medium".to_string(),
        IntentType::UpdateDocs | IntentType::AddTest => "low".to_string(),
        _ => "medium".to_string(),
    }
}

fn analysis_tools(requirements: &[AnalysisRequirement]) -> Vec<String> {
    use AnalysisRequirement::*;
    let mut tools = std::collections::BTreeSet::new();
    for req in requirements {
        match req {
            ReadCode => {
                tools.insert("read_file");
                tools.insert("list_directory");
            }
            SearchPattern => {
                tools.insert("grep");
                tools.insert("glob");
            }
            TraceFlow => {
                tools.insert("read_file");
                tools.insert("grep");
            }
            CheckTests => {
                tools.insert("glob");
                tools.insert("read_file");
            }
            ReviewDocs => {
                tools.insert("read_file");
            }
        }
    }
    tools.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bug_fix() {
        let d = IntentDecomposer::new().decompose("Fix memory conflict resolution bug");
        assert_eq!(d.intent_type, IntentType::FixBug);
        assert!(d.needs_analysis);
        assert!(d.affected_components.contains(&"memory".to_string()));
        assert_eq!(d.estimated_risk, "medium");
        assert!(d.analysis_tools.contains(&"read_file".to_string()));
    }

    #[test]
    fn governance_work_is_high_risk() {
        let d = IntentDecomposer::new().decompose("refactor the writegate approval flow");
        assert_eq!(d.intent_type, IntentType::Refactor);
        assert_eq!(d.estimated_risk, "high");
    }

    #[test]
    fn docs_skip_analysis_and_are_low_risk() {
        let d = IntentDecomposer::new().decompose("update docs with setup instructions");
        assert_eq!(d.intent_type, IntentType::UpdateDocs);
        assert!(!d.needs_analysis);
        assert!(d.analysis_requirements.is_empty());
        assert_eq!(d.estimated_risk, "low");
    }

    #[test]
    fn unclassifiable_intent_is_unknown() {
        let d = IntentDecomposer::new().decompose("zzz qqq");
        assert_eq!(d.intent_type, IntentType::Unknown);
        assert!(d.needs_analysis);
    }

    #[test]
    fn planning_tools_are_stable() {
        let d = IntentDecomposer::new().decompose("fix bug in api");
        assert_eq!(
            d.planning_tools,
            vec!["generate_diff".to_string(), "compute_checksum".to_string()]
        );
    }
}
