use crate::application::engine::SettlementEngine;
use crate::domain::order::Order;
use crate::domain::seller::{RiskStatus, SellerAccount};
use crate::error::Result;
use crate::infrastructure::gateway::SandboxGateway;
use crate::interfaces::csv::command_reader::{Command, CommandOp};
use tracing::debug;

/// Applies script commands to an engine running against the sandbox gateway.
pub struct CommandRunner {
    engine: SettlementEngine,
    gateway: SandboxGateway,
}

impl CommandRunner {
    pub fn new(engine: SettlementEngine, gateway: SandboxGateway) -> Self {
        Self { engine, gateway }
    }

    pub fn engine(&self) -> &SettlementEngine {
        &self.engine
    }

    pub async fn apply(&self, cmd: &Command) -> Result<()> {
        debug!(op = ?cmd.op, order = ?cmd.order, "applying command");
        match cmd.op {
            CommandOp::Seller => {
                let seller_id = cmd.seller_id()?;
                let destination = cmd
                    .reference()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("acct_{seller_id}"));
                let mut account = SellerAccount::new(seller_id, destination);
                if !cmd.note().is_empty() {
                    account = account.with_risk_status(cmd.note().parse::<RiskStatus>()?);
                }
                self.engine.register_seller(account).await?;
            }
            CommandOp::Order => {
                let amount = cmd.amount()?;
                let currency = cmd.currency()?;
                let reference = cmd.reference().map(str::to_string);
                if let Some(reference) = &reference {
                    self.gateway
                        .record_captured_payment(reference, amount.value(), currency)
                        .await;
                }
                let order = Order::new(
                    cmd.order_ref()?,
                    cmd.buyer_id()?,
                    cmd.seller_id()?,
                    amount.value(),
                    currency,
                    reference,
                );
                self.engine.place_order(order, &[]).await?;
            }
            CommandOp::Dispute => {
                let amount = cmd.optional_amount()?.map(|a| a.value());
                self.engine
                    .open_dispute(cmd.order_ref()?, amount, cmd.note())
                    .await?;
            }
            CommandOp::Fund => {
                let intent = self
                    .engine
                    .fund_wallet(&cmd.buyer_id()?, cmd.amount()?, cmd.currency()?)
                    .await?;
                self.engine.confirm_funding(&intent.data.intent_id).await?;
            }
            CommandOp::Charge => {
                self.engine
                    .charge_buyer(&cmd.buyer_id()?, cmd.amount()?, cmd.currency()?, cmd.note())
                    .await?;
            }
            CommandOp::Release => {
                self.engine
                    .release_escrow(cmd.order_ref()?, cmd.actor())
                    .await?;
            }
            CommandOp::Refund => {
                self.engine
                    .refund_escrow(cmd.order_ref()?, cmd.actor(), cmd.note())
                    .await?;
            }
            CommandOp::RefundWallet => {
                self.engine
                    .refund_to_wallet(cmd.order_ref()?, cmd.actor(), cmd.note())
                    .await?;
            }
            CommandOp::ForceRelease => {
                self.engine
                    .force_release(cmd.order_ref()?, cmd.actor(), cmd.note())
                    .await?;
            }
            CommandOp::Payout => {
                self.engine
                    .execute_manual_payout(cmd.order_ref()?, cmd.currency()?)
                    .await?;
            }
        }
        Ok(())
    }
}
