//! Hook points and assertion reporting.
//!
//! Hooks are nullable function pointers collected in a [`HookTable`] that
//! the configuration installs as [`KernelCfg::HOOKS`]. Entries default to
//! `None`; the `hooks` feature controls whether the dispatch sites are
//! compiled at all.
//!
//! [`KernelCfg::HOOKS`]: crate::KernelCfg::HOOKS
use crate::{thread::ThreadCb, KernelCfg};

/// The set of optional application hook points.
///
/// All hooks run inside the kernel, usually with the CPU lock active. They
/// must be short and must not call kernel services that can block.
pub struct HookTable<Traits: KernelCfg> {
    /// Called at the end of `System::init`.
    pub kernel_init: Option<fn()>,
    /// Called right before the first thread is dispatched.
    pub kernel_start: Option<fn()>,
    /// Called after a thread has been initialized and made ready.
    pub thread_init: Option<fn(&'static ThreadCb<Traits>)>,
    /// Called when a thread terminates itself.
    pub thread_term: Option<fn(&'static ThreadCb<Traits>)>,
    /// Called when the scheduler hands the processor over, with the
    /// outgoing and incoming threads. The outgoing thread is `None` for the
    /// very first dispatch.
    pub context_switch: Option<fn(Option<&'static ThreadCb<Traits>>, &'static ThreadCb<Traits>)>,
    /// Called when the idle thread is about to wait for an interrupt.
    pub idle_enter: Option<fn()>,
    /// Called when the idle thread resumes after an interrupt.
    pub idle_exit: Option<fn()>,
    /// Called on every system timer tick, in interrupt context.
    pub tick: Option<fn()>,
    /// Called when a kernel assertion fails, before the system halts.
    pub assertion: Option<fn(&AssertInfo<'_>)>,
}

impl<Traits: KernelCfg> HookTable<Traits> {
    /// A table with every hook absent.
    pub const NONE: Self = Self {
        kernel_init: None,
        kernel_start: None,
        thread_init: None,
        thread_term: None,
        context_switch: None,
        idle_enter: None,
        idle_exit: None,
        tick: None,
        assertion: None,
    };
}

impl<Traits: KernelCfg> Clone for HookTable<Traits> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelCfg> Copy for HookTable<Traits> {}

/// Context describing a failed kernel assertion, passed to the assertion
/// hook for post-mortem reporting.
#[derive(Debug, Clone, Copy)]
pub struct AssertInfo<'a> {
    /// The module the check lives in.
    pub module: &'a str,
    /// Source file of the check.
    pub file: &'a str,
    /// Source line of the check.
    pub line: u32,
    /// The expression that evaluated to `false`.
    pub expr: &'a str,
    /// Human-readable description of the violated contract.
    pub msg: &'a str,
}

/// Report a failed assertion and halt.
///
/// The assertion hook, when installed, gets a chance to record the failure
/// (e.g. over a debug channel). The system then halts by panicking; on
/// embedded targets the panic handler is expected not to return control to
/// the violating caller.
#[cold]
pub(crate) fn assert_failed<Traits: KernelCfg>(
    module: &str,
    file: &str,
    line: u32,
    expr: &str,
    msg: &str,
) -> ! {
    let info = AssertInfo {
        module,
        file,
        line,
        expr,
        msg,
    };

    #[cfg(feature = "hooks")]
    if let Some(f) = Traits::HOOKS.assertion {
        f(&info);
    }

    panic!(
        "kernel assertion failed: {} ({}, {}:{}): {}",
        info.expr, info.module, info.file, info.line, info.msg
    );
}

/// Check a caller contract. Enabled by the `debug_api` feature; expands to
/// nothing otherwise, making the violating call's behavior undefined.
macro_rules! api_assert {
    ($Traits:ty, $cond:expr, $msg:expr $(,)?) => {
        #[cfg(feature = "debug_api")]
        if !$cond {
            $crate::hook::assert_failed::<$Traits>(
                module_path!(),
                file!(),
                line!(),
                stringify!($cond),
                $msg,
            );
        }
    };
}

/// Check an internal invariant. Enabled by the `debug_internal` feature.
macro_rules! internal_assert {
    ($Traits:ty, $cond:expr, $msg:expr $(,)?) => {
        #[cfg(feature = "debug_internal")]
        if !$cond {
            $crate::hook::assert_failed::<$Traits>(
                module_path!(),
                file!(),
                line!(),
                stringify!($cond),
                $msg,
            );
        }
    };
}

pub(crate) use {api_assert, internal_assert};

macro_rules! define_hook_fns {
    ($( $(#[$meta:meta])* $name:ident => $field:ident ( $($arg:ident: $ty:ty),* ); )*) => {$(
        $(#[$meta])*
        #[inline]
        #[allow(unused_variables)]
        pub(crate) fn $name<Traits: KernelCfg>($($arg: $ty),*) {
            #[cfg(feature = "hooks")]
            if let Some(f) = Traits::HOOKS.$field {
                f($($arg),*);
            }
        }
    )*};
}

define_hook_fns! {
    at_kernel_init => kernel_init();
    at_kernel_start => kernel_start();
    at_thread_init => thread_init(thread: &'static ThreadCb<Traits>);
    at_thread_term => thread_term(thread: &'static ThreadCb<Traits>);
    at_context_switch => context_switch(
        from: Option<&'static ThreadCb<Traits>>,
        to: &'static ThreadCb<Traits>
    );
    at_idle_enter => idle_enter();
    at_idle_exit => idle_exit();
    at_tick => tick();
}
