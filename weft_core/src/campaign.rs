use crate::bytecode::Script;
use crate::config::CampaignConfig;
use crate::executor::ApplicationExecuter;
use crate::host::HostRuntime;
use crate::io::{IoError, IpcChannel, IpcListener};
use crate::mutator::SharedMutator;
use crate::oracle::{BugReport, CrashOracle, FindingStore, Oracle, Outcome};
use crate::runtime_error::ExecError;
use crate::template::{Template, TemplateError};
use crate::vm::VirtualMachine;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timing and limits of a network campaign, usually built from the
/// `[campaign]` table of the config file.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    /// How long a freshly launched target has to connect back.
    pub connect_timeout: Duration,
    /// How long to wait for the target to exit after terminating it.
    pub exit_timeout: Duration,
    /// Liveness check interval while waiting for a connection.
    pub poll_interval: Duration,
    /// Upper bound on executions per mutator, `None` for no bound.
    pub max_steps: Option<u64>,
}

impl From<&CampaignConfig> for CampaignSettings {
    fn from(config: &CampaignConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            exit_timeout: config.exit_timeout(),
            poll_interval: config.poll_interval(),
            max_steps: config.max_steps(),
        }
    }
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self::from(&CampaignConfig::default())
    }
}

/// A mutation whose script run ended in an error.
#[derive(Debug)]
pub struct ScriptFailure {
    pub template: String,
    pub mutator_state: String,
    pub error: ExecError,
}

/// Totals of a finished campaign.
#[derive(Debug, Default)]
pub struct CampaignReport {
    /// Script runs against a connected target.
    pub executions: u64,
    /// Launch errors and targets that never connected.
    pub failed_launches: u64,
    pub script_failures: Vec<ScriptFailure>,
    /// Reports from the oracle, in the order they were found.
    pub findings: Vec<BugReport>,
    /// Templates given up on because a mutator could not be borrowed.
    pub abandoned_templates: Vec<String>,
}

/// Drives a network campaign: for every template and every mutator in
/// it, launches the target once per mutation step and runs the script
/// against the connection the target opens.
pub struct FuzzServer {
    vm: VirtualMachine,
    host: Rc<RefCell<HostRuntime>>,
    listener: Box<dyn IpcListener>,
    app: Box<dyn ApplicationExecuter>,
    settings: CampaignSettings,
    oracle: Box<dyn Oracle>,
    store: Option<FindingStore>,
}

impl FuzzServer {
    /// Creates a server with a `CrashOracle` and no findings store.
    ///
    /// # Arguments
    /// * `listener` - Where the target connects back to after launch.
    /// * `app` - Launches and terminates the target.
    /// * `settings` - Timeouts and the per-mutator step limit.
    ///
    /// Every host primitive is registered with the server's VM and bound
    /// to the connection of the current run.
    pub fn new(
        listener: Box<dyn IpcListener>,
        app: Box<dyn ApplicationExecuter>,
        settings: CampaignSettings,
    ) -> Self {
        let host = Rc::new(RefCell::new(HostRuntime::new()));
        let mut vm = VirtualMachine::new();
        HostRuntime::register(&host, &mut vm);
        Self {
            vm,
            host,
            listener,
            app,
            settings,
            oracle: Box::new(CrashOracle::new()),
            store: None,
        }
    }

    /// Persists findings into `store` as they are found.
    pub fn with_store(mut self, store: FindingStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default `CrashOracle`.
    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn settings(&self) -> &CampaignSettings {
        &self.settings
    }

    /// Waits for the launched target to connect, giving up early if it
    /// exits.
    ///
    /// # Returns
    /// * `Ok(Some(channel))` - The target connected.
    /// * `Ok(None)` - The target exited or the connect timeout passed.
    /// * `Err(_)` - The listener failed.
    pub fn wait_for_incoming(&mut self) -> Result<Option<Box<dyn IpcChannel>>, IoError> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            if let Some(channel) = self.listener.accept(self.settings.poll_interval)? {
                return Ok(Some(channel));
            }
            if !self.app.is_alive() {
                debug!("target exited before connecting");
                return Ok(None);
            }
            if Instant::now() >= deadline {
                debug!(timeout = ?self.settings.connect_timeout, "target did not connect");
                return Ok(None);
            }
        }
    }

    /// Iterates every mutator of every template, in template name order.
    ///
    /// Templates without mutators are skipped. Each mutator is reset,
    /// driven until it finishes or hits `max_steps`, and reset again.
    ///
    /// # Returns
    /// The campaign totals. Per-mutation failures are recorded in the
    /// report and never end the campaign.
    pub fn run(&mut self, script: &Script) -> CampaignReport {
        let mut report = CampaignReport::default();
        info!(templates = script.templates.len(), "Campaign started");

        for (name, template) in &script.templates {
            let mutators = template.mutators();
            if mutators.is_empty() {
                debug!(template = %name, "no mutators, skipping");
                continue;
            }
            info!(template = %name, mutators = mutators.len(), "Fuzzing template");

            for (index, mutator) in mutators.iter().enumerate() {
                if let Err(e) = self.run_mutator(script, name, template, mutator, &mut report) {
                    error!(template = %name, mutator = index, "Abandoning template: {e}");
                    report.abandoned_templates.push(name.clone());
                    break;
                }
            }
        }

        info!(
            executions = report.executions,
            failed_launches = report.failed_launches,
            script_failures = report.script_failures.len(),
            findings = report.findings.len(),
            "Campaign finished"
        );
        report
    }

    fn run_mutator(
        &mut self,
        script: &Script,
        name: &str,
        template: &Template,
        mutator: &SharedMutator,
        report: &mut CampaignReport,
    ) -> Result<(), TemplateError> {
        mutator
            .try_borrow_mut()
            .map_err(|_| TemplateError::MutatorBusy)?
            .reset();

        let mut steps: u64 = 0;
        loop {
            let state = mutator
                .try_borrow()
                .map_err(|_| TemplateError::MutatorBusy)?
                .describe();
            let payload = template.generate()?;
            debug!(template = %name, step = steps, %state, "running mutation");
            self.execute_once(script, name, &state, &payload, report);
            steps += 1;

            if self.settings.max_steps.is_some_and(|max| steps >= max) {
                debug!(template = %name, steps, "step limit reached");
                break;
            }
            let mut mutator = mutator
                .try_borrow_mut()
                .map_err(|_| TemplateError::MutatorBusy)?;
            if !mutator.mutate() || mutator.finished() {
                break;
            }
        }

        mutator
            .try_borrow_mut()
            .map_err(|_| TemplateError::MutatorBusy)?
            .reset();
        Ok(())
    }

    /// One launch, execute, terminate cycle. Never fails: every problem is
    /// logged and counted in `report`.
    fn execute_once(
        &mut self,
        script: &Script,
        template: &str,
        state: &str,
        payload: &[u8],
        report: &mut CampaignReport,
    ) {
        if let Err(e) = self.app.launch() {
            warn!(template, state, "Failed to launch target: {e}");
            report.failed_launches += 1;
            return;
        }

        let channel = match self.wait_for_incoming() {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                warn!(template, state, "Target did not connect");
                self.shutdown_target();
                report.failed_launches += 1;
                return;
            }
            Err(e) => {
                warn!(template, state, "Accepting connection failed: {e}");
                self.shutdown_target();
                report.failed_launches += 1;
                return;
            }
        };

        self.host.borrow_mut().attach(channel);
        let result = self.vm.execute_script(script);
        self.host.borrow_mut().detach();
        report.executions += 1;

        if let Err(error) = result {
            warn!(template, state, "Script failed: {error}");
            report.script_failures.push(ScriptFailure {
                template: template.to_string(),
                mutator_state: state.to_string(),
                error,
            });
        }

        self.shutdown_target();

        let Some((exit_code, reason)) = self.app.status_code() else {
            warn!(template, state, "Target has no exit status");
            return;
        };
        let outcome = Outcome {
            template,
            mutator_state: state,
            input: payload,
            exit_code,
            reason,
        };
        if let Some(bug_report) = self.oracle.examine(&outcome) {
            error!(
                template,
                state,
                exit_code,
                hash = %bug_report.input_hash,
                "Target crashed: {}",
                bug_report.description
            );
            if let Some(store) = self.store.as_mut() {
                match store.record(&bug_report) {
                    Ok(true) => info!(dir = ?store.dir(), hash = %bug_report.input_hash, "Finding saved"),
                    Ok(false) => debug!(hash = %bug_report.input_hash, "finding already known"),
                    Err(e) => warn!("Failed to save finding: {e}"),
                }
            }
            report.findings.push(bug_report);
        }
    }

    fn shutdown_target(&mut self) {
        if let Err(e) = self.app.terminate() {
            warn!("Failed to terminate target: {e}");
        }
        match self.app.wait(Some(self.settings.exit_timeout)) {
            Ok(true) => {}
            Ok(false) => warn!(timeout = ?self.settings.exit_timeout, "Target did not exit in time"),
            Err(e) => warn!("Failed to wait for target: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, TerminationReason};
    use crate::generator::compile;
    use crate::io::{ByteOrder, MemoryChannel};

    type CrashRule = Box<dyn Fn(&[u8]) -> bool>;

    /// What the fake target does, shared by the fake executer and listener.
    struct TargetState {
        connects: bool,
        reply: Vec<u8>,
        crash_when: CrashRule,
        alive: bool,
        status: Option<(i32, TerminationReason)>,
        launches: usize,
        sent: Option<Rc<RefCell<Vec<u8>>>>,
        payloads: Vec<Vec<u8>>,
    }

    impl TargetState {
        fn new() -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                connects: true,
                reply: Vec::new(),
                crash_when: Box::new(|_| false),
                alive: false,
                status: None,
                launches: 0,
                sent: None,
                payloads: Vec::new(),
            }))
        }
    }

    struct FakeExecuter(Rc<RefCell<TargetState>>);

    impl ApplicationExecuter for FakeExecuter {
        fn launch(&mut self) -> Result<(), ExecutorError> {
            let mut target = self.0.borrow_mut();
            target.launches += 1;
            target.sent = None;
            if target.connects {
                target.alive = true;
                target.status = None;
            } else {
                target.alive = false;
                target.status = Some((1, TerminationReason::Normal));
            }
            Ok(())
        }

        fn terminate(&mut self) -> Result<(), ExecutorError> {
            let mut target = self.0.borrow_mut();
            if !target.alive {
                return Ok(());
            }
            let sent = target
                .sent
                .as_ref()
                .map(|sent| sent.borrow().clone())
                .unwrap_or_default();
            let crashed = (target.crash_when)(&sent);
            target.status = Some(if crashed {
                (139, TerminationReason::SegmentationFault)
            } else {
                (137, TerminationReason::Normal)
            });
            target.payloads.push(sent);
            target.alive = false;
            Ok(())
        }

        fn wait(&mut self, _timeout: Option<Duration>) -> Result<bool, ExecutorError> {
            Ok(!self.0.borrow().alive)
        }

        fn is_alive(&mut self) -> bool {
            self.0.borrow().alive
        }

        fn status_code(&self) -> Option<(i32, TerminationReason)> {
            self.0.borrow().status
        }

        fn set_command_line(&mut self, _arguments: &str) {}
    }

    struct FakeListener(Rc<RefCell<TargetState>>);

    impl IpcListener for FakeListener {
        fn accept(&mut self, _timeout: Duration) -> Result<Option<Box<dyn IpcChannel>>, IoError> {
            let mut target = self.0.borrow_mut();
            if !(target.alive && target.connects) {
                return Ok(None);
            }
            let channel = MemoryChannel::new(&target.reply, ByteOrder::BigEndian);
            target.sent = Some(channel.sent());
            Ok(Some(Box::new(channel)))
        }
    }

    fn settings(max_steps: Option<u64>) -> CampaignSettings {
        CampaignSettings {
            connect_timeout: Duration::from_millis(20),
            exit_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            max_steps,
        }
    }

    fn server(target: &Rc<RefCell<TargetState>>, max_steps: Option<u64>) -> FuzzServer {
        FuzzServer::new(
            Box::new(FakeListener(Rc::clone(target))),
            Box::new(FakeExecuter(Rc::clone(target))),
            settings(max_steps),
        )
    }

    const ARRAY_SCRIPT: &str =
        "template t = [ byte(7), { array<byte>(1-3) } ]; function main() { out(t); }";

    #[test]
    fn every_mutation_is_executed() {
        let target = TargetState::new();
        let script = compile(ARRAY_SCRIPT).unwrap();
        let report = server(&target, None).run(&script);

        assert_eq!(report.executions, 3);
        assert_eq!(report.failed_launches, 0);
        assert!(report.script_failures.is_empty());
        assert!(report.findings.is_empty());
        assert_eq!(
            target.borrow().payloads,
            vec![
                vec![7, 0x41],
                vec![7, 0x41, 0x41],
                vec![7, 0x41, 0x41, 0x41],
            ]
        );
    }

    #[test]
    fn unbounded_mutators_stop_at_step_limit_and_are_reset() {
        let target = TargetState::new();
        let script =
            compile("template t = [ { byte(250) } ]; function main() { out(t); }").unwrap();
        let report = server(&target, Some(5)).run(&script);

        assert_eq!(report.executions, 5);
        let payloads: Vec<u8> = target.borrow().payloads.iter().map(|p| p[0]).collect();
        assert_eq!(payloads, vec![250, 251, 252, 253, 254]);

        let template = script.template("t").unwrap();
        assert_eq!(template.generate().unwrap(), vec![250], "mutator is reset after its run");
    }

    #[test]
    fn crashes_become_findings() {
        let target = TargetState::new();
        target.borrow_mut().crash_when = Box::new(|sent| sent.len() == 3);
        let dir = tempfile::tempdir().unwrap();
        let store = FindingStore::open(dir.path()).unwrap();
        let script = compile(ARRAY_SCRIPT).unwrap();

        let mut server = server(&target, None).with_store(store);
        let report = server.run(&script);

        assert_eq!(report.executions, 3);
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.template, "t");
        assert_eq!(finding.reason, TerminationReason::SegmentationFault);
        assert_eq!(finding.input, vec![7, 0x41, 0x41]);
        assert!(
            finding.mutator_state.contains("count=2"),
            "Unexpected state: {}",
            finding.mutator_state
        );
        assert!(dir.path().join(format!("{}.json", finding.input_hash)).exists());
    }

    #[test]
    fn target_dying_before_connecting_is_a_failed_launch() {
        let target = TargetState::new();
        target.borrow_mut().connects = false;
        let script = compile(ARRAY_SCRIPT).unwrap();
        let report = server(&target, None).run(&script);

        assert_eq!(report.executions, 0);
        assert_eq!(report.failed_launches, 3);
        assert_eq!(target.borrow().launches, 3);
        assert!(report.findings.is_empty(), "Script never ran, nothing to judge");
    }

    #[test]
    fn script_errors_do_not_stop_the_campaign() {
        let target = TargetState::new();
        let script = compile(
            "template t = [ { array<byte>(1-3) } ]; function main() { out(t); var r = in8(); }",
        )
        .unwrap();
        let report = server(&target, None).run(&script);

        assert_eq!(report.executions, 3);
        assert_eq!(report.script_failures.len(), 3);
        let failure = &report.script_failures[1];
        assert_eq!(failure.template, "t");
        assert!(failure.mutator_state.contains("count=2"), "{}", failure.mutator_state);
        match &failure.error {
            ExecError::Io(IoError::Closed) => {}
            other => panic!("Expected Io(Closed), got {other:?}"),
        }
        assert_eq!(target.borrow().payloads.len(), 3, "target terminated every time");
    }

    #[test]
    fn templates_run_in_name_order() {
        let target = TargetState::new();
        target.borrow_mut().crash_when = Box::new(|_| true);
        let script = compile(
            "template b = [ { array<byte>(1-1) } ]; \
             template a = [ { array<word>(1-1) } ]; \
             template plain = [ byte(1) ]; \
             function main() { out(a); out(b); }",
        )
        .unwrap();
        let report = server(&target, None).run(&script);

        let order: Vec<&str> = report.findings.iter().map(|f| f.template.as_str()).collect();
        assert_eq!(order, vec!["a", "b"], "templates without mutators are skipped");
        assert_eq!(report.findings[0].input, vec![0x41, 0x41]);
    }

    #[test]
    fn busy_mutator_abandons_template() {
        let target = TargetState::new();
        let script = compile(ARRAY_SCRIPT).unwrap();
        let mutators = script.template("t").unwrap().mutators();
        let _held = mutators[0].borrow_mut();

        let report = server(&target, None).run(&script);
        assert_eq!(report.abandoned_templates, vec!["t".to_string()]);
        assert_eq!(report.executions, 0);
    }
}
