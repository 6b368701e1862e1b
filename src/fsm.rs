//! Transition-table state machines on top of mailbox actors.
//!
//! A behavior declares a starting state, a [`StateTable`] of ordered
//! [`Rule`]s per state, and a [`Hooks`] table. Hooks are plain function
//! pointers resolved once at construction:
//!
//! - `on_leave(state)` runs first,
//! - then `on_transition(from, to)`,
//! - then the state field changes,
//! - then `on_enter(state)`.
//!
//! Within one state the first matching rule wins. A message no rule matches
//! goes to [`FsmBehavior::handle_message`], which fails by default.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::actor::{Actor, Address, Flow, Mailbox};
use crate::error::{AppResult, DaqError};

/// How a rule recognises a message.
pub enum Match<M> {
    /// Message equals this value.
    Exact(M),
    /// Arbitrary predicate over the message.
    Predicate(Arc<dyn Fn(&M) -> bool + Send + Sync>),
}

impl<M: PartialEq> Match<M> {
    fn matches(&self, message: &M) -> bool {
        match self {
            Match::Exact(expected) => expected == message,
            Match::Predicate(predicate) => predicate(message),
        }
    }
}

/// One transition rule.
pub struct Rule<S, M> {
    /// Message matcher.
    pub matcher: Match<M>,
    /// Target state.
    pub to: S,
}

impl<S, M> Rule<S, M> {
    /// Rule firing on an exact message value.
    pub fn on(message: M, to: S) -> Self {
        Self {
            matcher: Match::Exact(message),
            to,
        }
    }

    /// Rule firing when `predicate` holds.
    pub fn when(predicate: impl Fn(&M) -> bool + Send + Sync + 'static, to: S) -> Self {
        Self {
            matcher: Match::Predicate(Arc::new(predicate)),
            to,
        }
    }
}

/// Ordered rule lists keyed by state.
pub struct StateTable<S, M> {
    rules: HashMap<S, Vec<Rule<S, M>>>,
}

impl<S: Eq + Hash, M: PartialEq> StateTable<S, M> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Declare a state with its rules in precedence order.
    pub fn state(mut self, state: S, rules: Vec<Rule<S, M>>) -> Self {
        self.rules.insert(state, rules);
        self
    }

    /// Whether `state` is declared.
    pub fn contains(&self, state: &S) -> bool {
        self.rules.contains_key(state)
    }

    /// First rule in `state` matching `message`.
    pub fn find(&self, state: &S, message: &M) -> Option<&Rule<S, M>> {
        self.rules
            .get(state)?
            .iter()
            .find(|rule| rule.matcher.matches(message))
    }
}

impl<S: Eq + Hash, M: PartialEq> Default for StateTable<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a hook sees about the transition in progress.
pub struct TransitionContext<S, M> {
    /// State being left.
    pub from: S,
    /// State being entered.
    pub to: S,
    /// Message that triggered the transition.
    pub trigger: M,
    /// Address of the owning actor, for self-posted follow-ups.
    pub address: Address<M>,
}

/// Future returned by hooks.
pub type HookFuture<'a> = BoxFuture<'a, AppResult<()>>;

/// A transition hook.
pub type Hook<B> = for<'a> fn(
    &'a mut B,
    &'a TransitionContext<<B as FsmBehavior>::State, <B as FsmBehavior>::Message>,
) -> HookFuture<'a>;

/// Enter/leave/transfer hook tables. Missing entries are no-ops.
pub struct Hooks<B: FsmBehavior> {
    enter: HashMap<B::State, Hook<B>>,
    leave: HashMap<B::State, Hook<B>>,
    transfer: HashMap<(B::State, B::State), Hook<B>>,
}

impl<B: FsmBehavior> Hooks<B> {
    /// No hooks.
    pub fn new() -> Self {
        Self {
            enter: HashMap::new(),
            leave: HashMap::new(),
            transfer: HashMap::new(),
        }
    }

    /// Run `hook` after entering `state`.
    pub fn on_enter(mut self, state: B::State, hook: Hook<B>) -> Self {
        self.enter.insert(state, hook);
        self
    }

    /// Run `hook` before leaving `state`.
    pub fn on_leave(mut self, state: B::State, hook: Hook<B>) -> Self {
        self.leave.insert(state, hook);
        self
    }

    /// Run `hook` between leaving `from` and entering `to`.
    pub fn on_transition(mut self, from: B::State, to: B::State, hook: Hook<B>) -> Self {
        self.transfer.insert((from, to), hook);
        self
    }
}

impl<B: FsmBehavior> Default for Hooks<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// The domain logic of a state machine actor.
#[async_trait]
pub trait FsmBehavior: Send + Sized + 'static {
    /// Finite state set.
    type State: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    /// Mailbox message type.
    type Message: PartialEq + Debug + Send + Sync + 'static;

    /// Name for logs.
    fn name(&self) -> &str;

    /// Initial state. Must be declared in the state table.
    fn starting_state(&self) -> Self::State;

    /// Transition rules.
    fn state_table(&self) -> StateTable<Self::State, Self::Message>;

    /// Transition hooks.
    fn hooks(&self) -> Hooks<Self> {
        Hooks::new()
    }

    /// Called once when the mailbox exists.
    async fn on_prepare(&mut self, _address: &Address<Self::Message>) -> AppResult<()> {
        Ok(())
    }

    /// Messages matching no rule in the current state.
    async fn handle_message(
        &mut self,
        _state: Self::State,
        message: Self::Message,
        _address: &Address<Self::Message>,
    ) -> AppResult<Flow> {
        Err(DaqError::UnhandledMessage(format!("{message:?}")))
    }

    /// One unit of work for the current state, once per loop iteration.
    async fn run_state(
        &mut self,
        _state: Self::State,
        _address: &Address<Self::Message>,
    ) -> AppResult<Flow> {
        Ok(Flow::Continue)
    }

    /// Called after every completed transition.
    fn on_state_changed(&mut self, _from: Self::State, _to: Self::State) {}

    /// Run-independent state to checkpoint.
    fn collect_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore checkpointed state.
    fn receive_state(&mut self, _state: serde_json::Value) -> AppResult<()> {
        Ok(())
    }
}

/// Actor driving an [`FsmBehavior`].
pub struct FsmActor<B: FsmBehavior> {
    behavior: B,
    state: B::State,
    table: StateTable<B::State, B::Message>,
    hooks: Hooks<B>,
    mailbox: Option<Mailbox<B::Message>>,
}

impl<B: FsmBehavior> FsmActor<B> {
    /// Build the actor, resolving the table and hooks once.
    pub fn new(behavior: B) -> AppResult<Self> {
        let state = behavior.starting_state();
        let table = behavior.state_table();
        if !table.contains(&state) {
            return Err(DaqError::InvalidStartingState(format!("{state:?}")));
        }
        let hooks = behavior.hooks();
        Ok(Self {
            behavior,
            state,
            table,
            hooks,
            mailbox: None,
        })
    }

    /// Current state.
    pub fn state(&self) -> B::State {
        self.state
    }

    /// The wrapped behavior.
    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    /// Mutable access to the wrapped behavior.
    pub fn behavior_mut(&mut self) -> &mut B {
        &mut self.behavior
    }

    /// Address of the mailbox. Fails before `prepare`.
    pub fn address(&self) -> AppResult<Address<B::Message>> {
        self.mailbox
            .as_ref()
            .map(Mailbox::address)
            .ok_or_else(|| DaqError::NotPrepared(self.behavior.name().to_string()))
    }

    /// Dispatch one message through the table.
    pub async fn handle(&mut self, message: B::Message) -> AppResult<Flow> {
        let address = self.address()?;
        let target = self.table.find(&self.state, &message).map(|rule| rule.to);
        match target {
            Some(to) => {
                self.transition_to(to, message, address).await?;
                Ok(Flow::Continue)
            }
            None => {
                trace!(actor = self.behavior.name(), ?message, state = ?self.state, "No matching rule");
                self.behavior
                    .handle_message(self.state, message, &address)
                    .await
            }
        }
    }

    async fn transition_to(
        &mut self,
        to: B::State,
        trigger: B::Message,
        address: Address<B::Message>,
    ) -> AppResult<()> {
        let from = self.state;
        debug!(actor = self.behavior.name(), ?from, ?to, "Transition");
        let ctx = TransitionContext {
            from,
            to,
            trigger,
            address,
        };

        if let Some(hook) = self.hooks.leave.get(&from).copied() {
            hook(&mut self.behavior, &ctx).await?;
        }
        if let Some(hook) = self.hooks.transfer.get(&(from, to)).copied() {
            hook(&mut self.behavior, &ctx).await?;
        }
        self.state = to;
        self.behavior.on_state_changed(from, to);
        if let Some(hook) = self.hooks.enter.get(&to).copied() {
            hook(&mut self.behavior, &ctx).await?;
        }
        Ok(())
    }

    /// Handle everything currently queued, in FIFO order.
    pub async fn read_all_messages(&mut self) -> AppResult<Flow> {
        let pending = match self.mailbox.as_mut() {
            Some(mailbox) => mailbox.drain(),
            None => return Err(DaqError::NotPrepared(self.behavior.name().to_string())),
        };
        for message in pending {
            if self.handle(message).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// One unit of state-dependent work.
    pub async fn run_current_state(&mut self) -> AppResult<Flow> {
        let address = self.address()?;
        self.behavior.run_state(self.state, &address).await
    }

    /// One full loop iteration: drain, work, yield.
    pub async fn tick(&mut self) -> AppResult<Flow> {
        if self.read_all_messages().await? == Flow::Stop {
            return Ok(Flow::Stop);
        }
        let flow = self.run_current_state().await?;
        tokio::task::yield_now().await;
        Ok(flow)
    }
}

#[async_trait]
impl<B: FsmBehavior> Actor for FsmActor<B> {
    fn name(&self) -> &str {
        self.behavior.name()
    }

    async fn prepare(&mut self) -> AppResult<()> {
        if self.mailbox.is_some() {
            return Ok(());
        }
        let mailbox = Mailbox::new();
        let address = mailbox.address();
        self.mailbox = Some(mailbox);
        self.behavior.on_prepare(&address).await
    }

    async fn run(&mut self) -> AppResult<()> {
        while self.tick().await? == Flow::Continue {}
        debug!(actor = self.behavior.name(), state = ?self.state, "Actor stopped");
        Ok(())
    }

    fn collect_state(&self) -> Option<serde_json::Value> {
        self.behavior.collect_state()
    }

    fn receive_state(&mut self, state: serde_json::Value) -> AppResult<()> {
        self.behavior.receive_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        A,
        B,
        C,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Msg {
        Go,
        Jump(u32),
        Noise,
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        unhandled: usize,
        tolerate_unhandled: bool,
    }

    fn leave_a<'a>(b: &'a mut Recorder, _: &'a TransitionContext<Light, Msg>) -> HookFuture<'a> {
        Box::pin(async move {
            b.log.push("leave_a".into());
            Ok(())
        })
    }

    fn a_to_c<'a>(b: &'a mut Recorder, ctx: &'a TransitionContext<Light, Msg>) -> HookFuture<'a> {
        Box::pin(async move {
            b.log.push(format!("a_to_c {:?}", ctx.trigger));
            Ok(())
        })
    }

    fn enter_c<'a>(b: &'a mut Recorder, _: &'a TransitionContext<Light, Msg>) -> HookFuture<'a> {
        Box::pin(async move {
            b.log.push("enter_c".into());
            Ok(())
        })
    }

    fn enter_b<'a>(b: &'a mut Recorder, _: &'a TransitionContext<Light, Msg>) -> HookFuture<'a> {
        Box::pin(async move {
            b.log.push("enter_b".into());
            Ok(())
        })
    }

    #[async_trait]
    impl FsmBehavior for Recorder {
        type State = Light;
        type Message = Msg;

        fn name(&self) -> &str {
            "recorder"
        }

        fn starting_state(&self) -> Light {
            Light::A
        }

        fn state_table(&self) -> StateTable<Light, Msg> {
            StateTable::new()
                .state(
                    Light::A,
                    vec![
                        Rule::when(|m| matches!(m, Msg::Jump(n) if *n > 10), Light::C),
                        Rule::when(|m| matches!(m, Msg::Jump(_)), Light::B),
                        Rule::on(Msg::Go, Light::B),
                    ],
                )
                .state(Light::B, vec![Rule::on(Msg::Go, Light::A)])
                .state(Light::C, vec![])
        }

        fn hooks(&self) -> Hooks<Self> {
            Hooks::new()
                .on_leave(Light::A, leave_a)
                .on_transition(Light::A, Light::C, a_to_c)
                .on_enter(Light::C, enter_c)
                .on_enter(Light::B, enter_b)
        }

        async fn handle_message(
            &mut self,
            _state: Light,
            message: Msg,
            _address: &Address<Msg>,
        ) -> AppResult<Flow> {
            self.unhandled += 1;
            if self.tolerate_unhandled {
                Ok(Flow::Continue)
            } else {
                Err(DaqError::UnhandledMessage(format!("{message:?}")))
            }
        }
    }

    struct Misconfigured;

    impl FsmBehavior for Misconfigured {
        type State = Light;
        type Message = Msg;

        fn name(&self) -> &str {
            "misconfigured"
        }

        fn starting_state(&self) -> Light {
            Light::C
        }

        fn state_table(&self) -> StateTable<Light, Msg> {
            StateTable::new().state(Light::A, vec![])
        }
    }

    async fn prepared(recorder: Recorder) -> FsmActor<Recorder> {
        let mut actor = FsmActor::new(recorder).unwrap();
        actor.prepare().await.unwrap();
        actor
    }

    #[test]
    fn starting_state_must_be_declared() {
        let result = FsmActor::new(Misconfigured);
        assert!(matches!(result, Err(DaqError::InvalidStartingState(_))));

        let actor = FsmActor::new(Recorder::default()).unwrap();
        assert_eq!(actor.state(), Light::A);
    }

    #[tokio::test]
    async fn hooks_fire_leave_transfer_enter() {
        let mut actor = prepared(Recorder::default()).await;
        actor.handle(Msg::Jump(42)).await.unwrap();

        assert_eq!(actor.state(), Light::C);
        assert_eq!(
            actor.behavior().log,
            vec!["leave_a", "a_to_c Jump(42)", "enter_c"]
        );
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let mut actor = prepared(Recorder::default()).await;
        actor.handle(Msg::Jump(3)).await.unwrap();
        assert_eq!(actor.state(), Light::B);

        actor.handle(Msg::Go).await.unwrap();
        assert_eq!(actor.state(), Light::A);
        assert_eq!(actor.behavior().log, vec!["leave_a", "enter_b"]);
    }

    #[tokio::test]
    async fn unmatched_message_goes_to_handler_once() {
        let mut actor = prepared(Recorder {
            tolerate_unhandled: true,
            ..Default::default()
        })
        .await;

        actor.handle(Msg::Noise).await.unwrap();
        assert_eq!(actor.behavior().unhandled, 1);
        assert_eq!(actor.state(), Light::A);
        assert!(actor.behavior().log.is_empty());
    }

    #[tokio::test]
    async fn unhandled_message_is_an_error_by_default() {
        let mut actor = prepared(Recorder::default()).await;
        let address = actor.address().unwrap();
        address.put(Msg::Noise).unwrap();

        let result = actor.run().await;
        assert!(matches!(result, Err(DaqError::UnhandledMessage(_))));
        assert_eq!(actor.state(), Light::A);
    }

    #[tokio::test]
    async fn mailbox_order_drives_visited_states() {
        let mut actor = prepared(Recorder {
            tolerate_unhandled: true,
            ..Default::default()
        })
        .await;
        let address = actor.address().unwrap();
        for message in [Msg::Go, Msg::Go, Msg::Jump(1), Msg::Noise, Msg::Go] {
            address.put(message).unwrap();
        }

        let mut visited = vec![actor.state()];
        let pending = actor.mailbox.as_mut().unwrap().drain();
        for message in pending {
            actor.handle(message).await.unwrap();
            visited.push(actor.state());
        }
        assert_eq!(
            visited,
            vec![Light::A, Light::B, Light::A, Light::B, Light::B, Light::A]
        );
    }

    #[tokio::test]
    async fn handle_before_prepare_fails() {
        let mut actor = FsmActor::new(Recorder::default()).unwrap();
        assert!(matches!(
            actor.handle(Msg::Go).await,
            Err(DaqError::NotPrepared(_))
        ));
    }
}
