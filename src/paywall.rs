use crate::config::PaywallConfig;
use crate::error::JournalError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub label: String,
    pub url: String,
}

/// Upgrade prompt. The controller decides when it shows; this only holds state.
#[derive(Debug, Clone)]
pub struct PaywallGate {
    visible: bool,
    plans: Vec<Plan>,
}

impl PaywallGate {
    pub fn new(config: &PaywallConfig) -> Self {
        Self {
            visible: false,
            plans: vec![
                Plan {
                    label: config.monthly_label.clone(),
                    url: config.monthly_url.clone(),
                },
                Plan {
                    label: config.yearly_label.clone(),
                    url: config.yearly_url.clone(),
                },
            ],
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn plan(&self, index: usize) -> Option<&Plan> {
        self.plans.get(index)
    }

    pub fn show(&mut self) {
        if !self.visible {
            tracing::info!("paywall: shown");
        }
        self.visible = true;
    }

    pub fn dismiss(&mut self) {
        self.visible = false;
    }

    /// Shows the gate when a feedback failure means the allowance ran out.
    pub fn on_feedback_error(&mut self, err: &JournalError) -> bool {
        if err.is_payment_required() {
            self.show();
            true
        } else {
            false
        }
    }

    pub fn on_account(&mut self, is_premium: bool) {
        if is_premium {
            self.dismiss();
        }
    }
}

impl Default for PaywallGate {
    fn default() -> Self {
        Self::new(&PaywallConfig::default())
    }
}
