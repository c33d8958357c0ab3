use crate::models::{OrderResult, SellInstruction};

/// Current price for a token
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    async fn get_price(&self, token_address: &str) -> anyhow::Result<f64>;
}

/// Executes sell orders; an `Err` counts as a failed order
#[async_trait::async_trait]
pub trait OrderSink: Send + Sync {
    async fn execute_order(&self, instruction: SellInstruction) -> anyhow::Result<OrderResult>;
}

/// Dry-run sink: fills every order at the quoted proceeds
#[derive(Debug, Clone, Copy, Default)]
pub struct PaperOrderSink;

#[async_trait::async_trait]
impl OrderSink for PaperOrderSink {
    async fn execute_order(&self, instruction: SellInstruction) -> anyhow::Result<OrderResult> {
        tracing::info!(
            position_id = %instruction.position_id,
            token = %instruction.token_address,
            quantity = instruction.quantity,
            price = instruction.price,
            proceeds = instruction.expected_proceeds,
            "[DRY RUN] Sell filled"
        );
        Ok(OrderResult::filled(
            instruction.quantity,
            instruction.expected_proceeds,
        ))
    }
}
