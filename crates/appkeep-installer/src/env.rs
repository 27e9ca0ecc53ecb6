use std::sync::Arc;

use appkeep_store::PackageStore;

use crate::artifact::ExtractionEnv;
use crate::command::{CommandRunner, RunOptions};
use crate::context::OperationContext;
use crate::inventory::InventoryReconciler;
use crate::layout::StateLayout;
use crate::process::ProcessControl;
use crate::scan::Scanner;
use crate::settings::Settings;

/// Shared collaborators for installs, uninstalls and scans.
#[derive(Clone)]
pub struct OperationEnv {
    pub settings: Settings,
    pub layout: StateLayout,
    pub runner: Arc<dyn CommandRunner>,
    pub processes: Arc<dyn ProcessControl>,
    pub packages: Arc<dyn PackageStore>,
    pub reconciler: Arc<InventoryReconciler>,
}

impl OperationEnv {
    pub fn run_options(&self) -> RunOptions {
        self.settings.run_options()
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::from_settings(&self.settings)
    }

    pub fn new_context(&self) -> OperationContext {
        OperationContext::with_poll_interval(
            self.settings.operation_deadline,
            self.settings.cancel_poll_interval,
        )
    }

    pub fn extraction_env<'a>(&'a self, ctx: &'a OperationContext) -> ExtractionEnv<'a> {
        ExtractionEnv {
            runner: self.runner.as_ref(),
            ctx,
            options: self.run_options(),
        }
    }
}
