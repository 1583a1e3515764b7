mod brain;
mod dom;
mod executor;
mod hands;
mod recover;
mod resolve;
mod types;

use anyhow::{Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use brain::{Brain, PlanError};
use executor::{Executor, StepOutcome};
use hands::BrowserSession;
use types::{Action, BrowserState, DIGEST_MAX_CHARS, MAX_ITERATIONS_PER_TASK, SessionContext};

#[derive(Parser)]
#[command(name = "webpilot", about = "LLM-driven web browser automation agent")]
struct Cli {
    /// Chat model used for planning.
    #[arg(long, default_value = "gpt-5.2")]
    model: String,

    /// Planning rounds allowed per task after the initial plan.
    #[arg(long, default_value_t = MAX_ITERATIONS_PER_TASK)]
    max_iterations: usize,

    /// Run Chrome headless (default is a visible window).
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpilot=info")),
        )
        .init();
    let cli = Cli::parse();

    info!("starting web automation agent");
    let headless = cli.headless;
    let mut session = tokio::task::spawn_blocking(move || BrowserSession::launch(headless))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {e}"))??;
    let mut brain = Brain::new(cli.model)?;
    let mut ctx = SessionContext::default();

    println!("Web automation agent started. Type an instruction, or 'exit' to quit.");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout())?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let instruction = line.trim().to_string();
        if instruction.is_empty() {
            continue;
        }
        if is_exit_command(&instruction) {
            break;
        }
        (session, ctx) =
            run_task(session, ctx, &mut brain, &instruction, cli.max_iterations).await?;
    }

    info!("shutting down, releasing browser session");
    Ok(())
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskVerdict {
    Completed,
    Incomplete { rounds: usize },
    Aborted,
}

/// The three capabilities the task loop needs from its surroundings. The
/// production implementation bridges to the browser and the chat model;
/// tests script it.
trait TaskDriver {
    async fn observe(&mut self) -> Result<(String, BrowserState)>;
    async fn plan(&mut self, prompt: &str) -> Result<Vec<Action>, PlanError>;
    /// Execute a plan; returns true when the model signalled completion.
    async fn act(&mut self, plan: Vec<Action>) -> Result<bool>;
}

/// One task: plan, act, observe, repeat until the model signals completion
/// or the iteration cap is hit. An empty plan counts as completion; a
/// malformed plan aborts the task.
async fn drive_task(
    driver: &mut impl TaskDriver,
    instruction: &str,
    max_iterations: usize,
) -> Result<TaskVerdict> {
    let (_, state) = driver.observe().await?;
    let mut plan = match driver.plan(instruction).await {
        Ok(plan) => plan,
        Err(e) => {
            warn!(error = %e, "planning failed, aborting task");
            return Ok(TaskVerdict::Aborted);
        }
    };
    dedup_navigation(&mut plan, state.domain.as_deref());
    if plan.is_empty() {
        info!("no actions to execute");
        return Ok(TaskVerdict::Completed);
    }
    info!(actions = plan.len(), "executing initial plan");
    if driver.act(plan).await? {
        return Ok(TaskVerdict::Completed);
    }

    for iteration in 1..=max_iterations {
        let (digest, state) = driver.observe().await?;
        info!(iteration, url = %state.url, "analyzing page and planning next step");
        let prompt = continuation_prompt(instruction, &digest, &state);
        let mut plan = match driver.plan(&prompt).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "planning failed, aborting task");
                return Ok(TaskVerdict::Aborted);
            }
        };
        dedup_navigation(&mut plan, state.domain.as_deref());
        if plan.is_empty() {
            return Ok(TaskVerdict::Completed);
        }
        info!(iteration, actions = plan.len(), "executing actions");
        if driver.act(plan).await? {
            return Ok(TaskVerdict::Completed);
        }
    }
    Ok(TaskVerdict::Incomplete {
        rounds: max_iterations,
    })
}

/// The follow-up prompt for every round after the initial plan. Tab position
/// is included once more than one tab is open so the model can reason about
/// switching.
fn continuation_prompt(instruction: &str, digest: &str, state: &BrowserState) -> String {
    let mut prompt = format!(
        "Continue executing the instruction: '{instruction}'. What's the next step?\n\
         Current page: {} ({})",
        state.title, state.url
    );
    if state.tab_count > 1 {
        prompt.push_str(&format!(
            " [tab {} of {}]",
            state.tab_index + 1,
            state.tab_count
        ));
    }
    prompt.push_str(&format!("\nPage elements:\n{digest}"));
    prompt
}

/// Production driver: the session and context are moved through
/// `spawn_blocking` for each browser-bound phase and restored afterwards.
struct AgentDriver<'b> {
    session: Option<BrowserSession>,
    ctx: Option<SessionContext>,
    brain: &'b mut Brain,
}

impl TaskDriver for AgentDriver<'_> {
    async fn observe(&mut self) -> Result<(String, BrowserState)> {
        let session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("browser session lost"))?;
        let (session, digest, state) = observe(session).await?;
        self.session = Some(session);
        Ok((digest, state))
    }

    async fn plan(&mut self, prompt: &str) -> Result<Vec<Action>, PlanError> {
        self.brain.request_plan(prompt).await
    }

    async fn act(&mut self, plan: Vec<Action>) -> Result<bool> {
        let session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("browser session lost"))?;
        let ctx = self.ctx.take().unwrap_or_default();
        let (session, ctx, complete) = exec_plan(session, ctx, plan).await?;
        self.session = Some(session);
        self.ctx = Some(ctx);
        Ok(complete)
    }
}

async fn run_task(
    session: BrowserSession,
    ctx: SessionContext,
    brain: &mut Brain,
    instruction: &str,
    max_iterations: usize,
) -> Result<(BrowserSession, SessionContext)> {
    info!(instruction, "starting task");
    let mut driver = AgentDriver {
        session: Some(session),
        ctx: Some(ctx),
        brain,
    };
    let verdict = drive_task(&mut driver, instruction, max_iterations).await?;
    let summary = match verdict {
        TaskVerdict::Completed => {
            info!("task completed");
            "completed".to_string()
        }
        TaskVerdict::Aborted => "aborted on a malformed plan".to_string(),
        TaskVerdict::Incomplete { rounds } => {
            info!(rounds, "iteration limit reached, task may be incomplete");
            format!("incomplete after {rounds} planning rounds")
        }
    };
    driver
        .brain
        .finish_task(&format!("Task '{instruction}' ended: {summary}."));
    let session = driver
        .session
        .take()
        .ok_or_else(|| anyhow!("browser session lost"))?;
    Ok((session, driver.ctx.take().unwrap_or_default()))
}

/// Execute a plan on the blocking pool. Per-action failures are logged and
/// skipped; only a completion signal stops the plan early.
async fn exec_plan(
    mut session: BrowserSession,
    mut ctx: SessionContext,
    plan: Vec<Action>,
) -> Result<(BrowserSession, SessionContext, bool)> {
    tokio::task::spawn_blocking(move || {
        let mut complete = false;
        {
            let mut executor = Executor::new(&mut session, &mut ctx);
            for action in &plan {
                match executor.execute(action) {
                    Ok(StepOutcome::Complete) => {
                        complete = true;
                        break;
                    }
                    Ok(StepOutcome::Continue) => {}
                    Err(e) => {
                        warn!(
                            kind = action.kind(),
                            error = %format!("{e:#}"),
                            "action failed, continuing"
                        );
                    }
                }
            }
        }
        (session, ctx, complete)
    })
    .await
    .map_err(|e| anyhow!("executor task panicked: {e}"))
}

/// Read the current page and summarize it for the model.
async fn observe(session: BrowserSession) -> Result<(BrowserSession, String, BrowserState)> {
    tokio::task::spawn_blocking(move || {
        let markup = hands::page_markup(&session.tab).unwrap_or_default();
        let digest = dom::build_digest(&markup, DIGEST_MAX_CHARS);
        let state = session.state();
        (session, digest, state)
    })
    .await
    .map_err(|e| anyhow!("observation task panicked: {e}"))
}

/// Drop a leading navigate action that targets the domain we are already on;
/// reloading would only lose page state. Only the first action is inspected.
fn dedup_navigation(plan: &mut Vec<Action>, current_domain: Option<&str>) {
    let Some(current) = current_domain else {
        return;
    };
    let Some(Action::Navigate { url }) = plan.first() else {
        return;
    };
    let target = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    if target.as_deref() == Some(current) {
        debug!(url, "dropping redundant navigation to the current domain");
        plan.remove(0);
    }
}

fn is_exit_command(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "exit" | "quit" | "stop"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(value: serde_json::Value) -> Vec<Action> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn same_domain_navigation_is_dropped() {
        let mut actions = plan(json!([
            {"action": "navigate", "url": "https://www.youtube.com/results"},
            {"action": "press_enter", "use_previous_element": true}
        ]));
        dedup_navigation(&mut actions, Some("www.youtube.com"));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), "press_enter");
    }

    #[test]
    fn cross_domain_navigation_is_kept() {
        let mut actions = plan(json!([
            {"action": "navigate", "url": "https://www.amazon.com"}
        ]));
        dedup_navigation(&mut actions, Some("www.youtube.com"));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn only_the_first_action_is_inspected() {
        let mut actions = plan(json!([
            {"action": "wait", "seconds": 1},
            {"action": "navigate", "url": "https://www.youtube.com"}
        ]));
        dedup_navigation(&mut actions, Some("www.youtube.com"));
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn unparsable_urls_are_left_alone() {
        let mut actions = plan(json!([
            {"action": "navigate", "url": "not a url"}
        ]));
        dedup_navigation(&mut actions, Some("www.youtube.com"));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn empty_plan_has_nothing_to_dedup() {
        let mut actions: Vec<Action> = Vec::new();
        dedup_navigation(&mut actions, Some("example.org"));
        assert!(actions.is_empty());
    }

    #[test]
    fn exit_keywords_are_case_insensitive() {
        for word in ["exit", "QUIT", "Stop", "  exit  "] {
            assert!(is_exit_command(word));
        }
        assert!(!is_exit_command("search for exit signs"));
    }

    #[test]
    fn continuation_prompt_mentions_tabs_only_when_several_are_open() {
        let mut state = BrowserState {
            url: "https://example.org/".to_string(),
            title: "Example".to_string(),
            domain: Some("example.org".to_string()),
            tab_index: 1,
            tab_count: 1,
        };
        let prompt = continuation_prompt("find the docs", "input: search", &state);
        assert!(prompt.contains("find the docs"));
        assert!(prompt.contains("Example (https://example.org/)"));
        assert!(prompt.contains("input: search"));
        assert!(!prompt.contains("tab"));

        state.tab_count = 3;
        let prompt = continuation_prompt("find the docs", "", &state);
        assert!(prompt.contains("[tab 2 of 3]"));
    }

    /// Scripted driver: hands out queued plans, records what it executed,
    /// and stops mid-plan on a completion action like the real executor.
    struct ScriptedDriver {
        plans: std::collections::VecDeque<Vec<Action>>,
        executed: Vec<&'static str>,
        rounds_planned: usize,
    }

    impl ScriptedDriver {
        fn new(plans: Vec<Vec<Action>>) -> Self {
            Self {
                plans: plans.into(),
                executed: Vec::new(),
                rounds_planned: 0,
            }
        }
    }

    impl TaskDriver for ScriptedDriver {
        async fn observe(&mut self) -> Result<(String, BrowserState)> {
            Ok((
                String::new(),
                BrowserState {
                    url: "https://example.org/".to_string(),
                    title: "Example".to_string(),
                    domain: None,
                    tab_index: 0,
                    tab_count: 1,
                },
            ))
        }

        async fn plan(&mut self, _prompt: &str) -> Result<Vec<Action>, PlanError> {
            self.rounds_planned += 1;
            Ok(self.plans.pop_front().unwrap_or_default())
        }

        async fn act(&mut self, plan: Vec<Action>) -> Result<bool> {
            for action in &plan {
                self.executed.push(action.kind());
                if matches!(action, Action::Complete) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    #[tokio::test]
    async fn empty_initial_plan_completes_the_task_without_acting() {
        let mut driver = ScriptedDriver::new(vec![Vec::new()]);
        let verdict = drive_task(&mut driver, "do nothing", 10).await.unwrap();
        assert_eq!(verdict, TaskVerdict::Completed);
        assert!(driver.executed.is_empty());
        assert_eq!(driver.rounds_planned, 1);
    }

    #[tokio::test]
    async fn iteration_cap_stops_a_task_that_never_completes() {
        let endless: Vec<Vec<Action>> = (0..20)
            .map(|_| plan(json!([{"action": "scroll", "direction": "down"}])))
            .collect();
        let mut driver = ScriptedDriver::new(endless);
        let verdict = drive_task(&mut driver, "scroll forever", 10).await.unwrap();
        assert_eq!(verdict, TaskVerdict::Incomplete { rounds: 10 });
        // one initial plan plus one per allowed iteration
        assert_eq!(driver.rounds_planned, 11);
        assert_eq!(driver.executed.len(), 11);
    }

    #[tokio::test]
    async fn search_task_executes_actions_in_plan_order() {
        let mut driver = ScriptedDriver::new(vec![
            plan(json!([
                {"action": "navigate", "url": "https://www.youtube.com"},
                {"action": "find_and_click",
                 "element_properties": {"tag": "input", "aria-label": "Search"}},
                {"action": "type", "text": "cat videos", "use_previous_element": true},
                {"action": "press_enter", "use_previous_element": true}
            ])),
            plan(json!([{"action": "complete"}])),
        ]);
        let verdict = drive_task(&mut driver, "search for cat videos", 10)
            .await
            .unwrap();
        assert_eq!(verdict, TaskVerdict::Completed);
        assert_eq!(
            driver.executed,
            ["navigate", "find_and_click", "type", "press_enter", "complete"]
        );
    }

    #[tokio::test]
    async fn completion_mid_plan_stops_the_remaining_actions() {
        let mut driver = ScriptedDriver::new(vec![plan(json!([
            {"action": "go_back"},
            {"action": "complete"},
            {"action": "refresh_page"}
        ]))]);
        let verdict = drive_task(&mut driver, "go back", 10).await.unwrap();
        assert_eq!(verdict, TaskVerdict::Completed);
        assert_eq!(driver.executed, ["go_back", "complete"]);
    }
}
