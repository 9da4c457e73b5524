//! Goal-to-plan decomposition.
//!
//! Pure function over static data plus the goal string: classify the goal by
//! keyword-overlap scoring against a fixed table, then instantiate the
//! matching step template. Never fails; ties and zero scores fall back to the
//! mixed template.

use weft_core::plan::{Plan, Step, TaskCategory};
use weft_core::types::WorkerType;

/// Keyword table driving classification. Score = number of keywords the
/// lowercased goal contains.
const KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::Research,
        &["research", "investigate", "find", "look up", "study", "explore"],
    ),
    (
        TaskCategory::Development,
        &["build", "create", "develop", "code", "implement", "write code", "program"],
    ),
    (
        TaskCategory::Writing,
        &["write", "create content", "draft", "article", "blog", "script", "documentation"],
    ),
    (
        TaskCategory::Analysis,
        &["analyze", "review", "examine", "evaluate", "assess", "study data"],
    ),
    (
        TaskCategory::Design,
        &["design", "architecture", "plan", "blueprint", "structure", "schema"],
    ),
    // Podcast goals span research, writing, and production, so they get the
    // mixed workflow; the keywords exist to outscore incidental verbs.
    (
        TaskCategory::Mixed,
        &["podcast", "episode", "show", "audio content"],
    ),
];

/// Classify a goal into a task category.
///
/// Stable under keyword-match ordering: the winner is the unique category
/// with the highest score; a tie for the top score (or no match at all)
/// yields `Mixed`.
pub fn classify(goal: &str) -> TaskCategory {
    let goal_lower = goal.to_lowercase();

    let mut best = TaskCategory::Mixed;
    let mut best_score = 0usize;
    let mut tied = false;

    for (category, keywords) in KEYWORDS {
        let score = keywords.iter().filter(|k| goal_lower.contains(**k)).count();
        if score > best_score {
            best = *category;
            best_score = score;
            tied = false;
        } else if score == best_score && score > 0 {
            tied = true;
        }
    }

    if best_score == 0 || tied {
        TaskCategory::Mixed
    } else {
        best
    }
}

/// Map a goal to an ordered step sequence. Always returns a non-empty plan.
pub fn plan(goal: &str) -> Plan {
    let category = classify(goal);
    let steps = match category {
        TaskCategory::Research => research_steps(goal),
        TaskCategory::Development => development_steps(goal),
        TaskCategory::Writing => writing_steps(goal),
        TaskCategory::Analysis => analysis_steps(goal),
        TaskCategory::Design => design_steps(goal),
        TaskCategory::Mixed => mixed_steps(goal),
    };
    Plan::new(goal, category, steps)
}

fn research_steps(goal: &str) -> Vec<Step> {
    vec![
        Step::new(
            "research-1",
            "Conduct initial research on the topic",
            WorkerType::Researcher,
            goal,
        )
        .with_output("research_notes.md"),
        Step::new(
            "research-2",
            "Synthesize and organize research findings",
            WorkerType::Analyst,
            "Analyze the research notes and identify key insights, trends, and patterns",
        )
        .with_inputs(vec!["research_notes.md".into()])
        .with_output("research_synthesis.md"),
        Step::new(
            "research-3",
            "Create summary and recommendations",
            WorkerType::Writer,
            "Create a clear summary of findings with actionable recommendations",
        )
        .with_inputs(vec!["research_notes.md".into(), "research_synthesis.md".into()])
        .with_output("research_summary.md"),
    ]
}

fn development_steps(goal: &str) -> Vec<Step> {
    vec![
        Step::new(
            "dev-1",
            "Design solution architecture",
            WorkerType::Designer,
            format!("Design the architecture for: {goal}"),
        )
        .with_output("architecture_design.md"),
        Step::new(
            "dev-2",
            "Implement the solution",
            WorkerType::Coder,
            "Implement the solution based on the architecture",
        )
        .with_inputs(vec!["architecture_design.md".into()])
        .with_output("implementation.md")
        .with_approval(),
        Step::new(
            "dev-3",
            "Test and validate the implementation",
            WorkerType::Qa,
            "Test the implementation and identify any issues",
        )
        .with_inputs(vec!["architecture_design.md".into(), "implementation.md".into()])
        .with_output("test_report.md"),
    ]
}

fn writing_steps(goal: &str) -> Vec<Step> {
    vec![
        Step::new(
            "write-1",
            "Gather information for content creation",
            WorkerType::Researcher,
            format!("Research information needed for: {goal}"),
        )
        .with_output("content_research.md"),
        Step::new(
            "write-2",
            "Create first draft",
            WorkerType::Writer,
            format!("Write a first draft for: {goal}"),
        )
        .with_inputs(vec!["content_research.md".into()])
        .with_output("draft.md"),
        Step::new(
            "write-3",
            "Review and refine the content",
            WorkerType::Qa,
            "Review and edit the draft for quality, clarity, and completeness",
        )
        .with_inputs(vec!["content_research.md".into(), "draft.md".into()])
        .with_output("final_content.md"),
    ]
}

fn analysis_steps(goal: &str) -> Vec<Step> {
    vec![
        Step::new(
            "analysis-1",
            "Collect relevant data and information",
            WorkerType::Researcher,
            format!("Gather data needed for analysis: {goal}"),
        )
        .with_output("data_collection.md"),
        Step::new(
            "analysis-2",
            "Perform detailed analysis",
            WorkerType::Analyst,
            format!("Analyze the collected data to address: {goal}"),
        )
        .with_inputs(vec!["data_collection.md".into()])
        .with_output("analysis_results.md"),
        Step::new(
            "analysis-3",
            "Create analysis report",
            WorkerType::Writer,
            "Create a comprehensive report with findings and recommendations",
        )
        .with_inputs(vec!["data_collection.md".into(), "analysis_results.md".into()])
        .with_output("analysis_report.md"),
    ]
}

fn design_steps(goal: &str) -> Vec<Step> {
    vec![
        Step::new(
            "design-1",
            "Research best practices and requirements",
            WorkerType::Researcher,
            format!("Research requirements and best practices for: {goal}"),
        )
        .with_output("design_requirements.md"),
        Step::new(
            "design-2",
            "Create initial design",
            WorkerType::Designer,
            format!("Create a detailed design for: {goal}"),
        )
        .with_inputs(vec!["design_requirements.md".into()])
        .with_output("design_blueprint.md"),
        Step::new(
            "design-3",
            "Review and validate design",
            WorkerType::Qa,
            "Review the design for completeness, feasibility, and best practices",
        )
        .with_inputs(vec!["design_requirements.md".into(), "design_blueprint.md".into()])
        .with_output("design_review.md"),
    ]
}

fn mixed_steps(goal: &str) -> Vec<Step> {
    // Deliverable step leans coder for code-flavored goals, writer otherwise.
    let deliverable_worker = if goal.to_lowercase().contains("code") {
        WorkerType::Coder
    } else {
        WorkerType::Writer
    };

    vec![
        Step::new(
            "mixed-1",
            "Analyze and understand the requirements",
            WorkerType::Analyst,
            format!("Break down the requirements for: {goal}"),
        )
        .with_output("requirements_analysis.md"),
        Step::new(
            "mixed-2",
            "Research relevant information",
            WorkerType::Researcher,
            "Research information needed to address the requirements",
        )
        .with_inputs(vec!["requirements_analysis.md".into()])
        .with_output("research_findings.md"),
        Step::new(
            "mixed-3",
            "Create solution design",
            WorkerType::Designer,
            "Design a solution based on requirements and research",
        )
        .with_inputs(vec!["requirements_analysis.md".into(), "research_findings.md".into()])
        .with_output("solution_design.md"),
        Step::new(
            "mixed-4",
            "Implement or create deliverables",
            deliverable_worker,
            "Create the main deliverables for the solution",
        )
        .with_inputs(vec![
            "requirements_analysis.md".into(),
            "research_findings.md".into(),
            "solution_design.md".into(),
        ])
        .with_output("deliverables.md")
        .with_approval(),
        Step::new(
            "mixed-5",
            "Review and validate results",
            WorkerType::Qa,
            "Review all deliverables for quality and completeness",
        )
        .with_inputs(vec![
            "requirements_analysis.md".into(),
            "research_findings.md".into(),
            "solution_design.md".into(),
            "deliverables.md".into(),
        ])
        .with_output("final_review.md"),
    ]
}
