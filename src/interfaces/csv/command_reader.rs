use crate::domain::ledger::SubjectId;
use crate::domain::money::{Currency, MinorUnits};
use crate::error::{Result, SettlementError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOp {
    Seller,
    Order,
    Dispute,
    Fund,
    Charge,
    Release,
    Refund,
    RefundWallet,
    ForceRelease,
    Payout,
}

/// One row of a command script. Which columns matter depends on `op`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Command {
    pub op: CommandOp,
    pub order: Option<String>,
    pub buyer: Option<String>,
    pub seller: Option<String>,
    /// Major units, at most two decimal places.
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub reference: Option<String>,
    pub actor: Option<String>,
    pub note: Option<String>,
}

impl Command {
    pub const DEFAULT_ACTOR: &'static str = "system";

    pub fn order_ref(&self) -> Result<&str> {
        required("order", &self.order)
    }

    pub fn buyer_id(&self) -> Result<SubjectId> {
        SubjectId::new(required("buyer", &self.buyer)?)
    }

    pub fn seller_id(&self) -> Result<SubjectId> {
        SubjectId::new(required("seller", &self.seller)?)
    }

    pub fn currency(&self) -> Result<Currency> {
        required("currency", &self.currency)?.parse()
    }

    pub fn amount(&self) -> Result<MinorUnits> {
        let amount = self.amount.ok_or_else(|| missing("amount"))?;
        MinorUnits::from_major(amount, self.currency()?)
    }

    /// Like `amount`, but an absent column is not an error.
    pub fn optional_amount(&self) -> Result<Option<MinorUnits>> {
        match self.amount {
            Some(_) => self.amount().map(Some),
            None => Ok(None),
        }
    }

    pub fn reference(&self) -> Option<&str> {
        non_empty(&self.reference)
    }

    pub fn actor(&self) -> &str {
        non_empty(&self.actor).unwrap_or(Self::DEFAULT_ACTOR)
    }

    pub fn note(&self) -> &str {
        non_empty(&self.note).unwrap_or_default()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn required<'a>(column: &str, value: &'a Option<String>) -> Result<&'a str> {
    non_empty(value).ok_or_else(|| missing(column))
}

fn missing(column: &str) -> SettlementError {
    SettlementError::ValidationError(format!("Missing required column: {column}"))
}

/// Reads commands from a CSV source, one per row, lazily.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(SettlementError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = "op, order, buyer, seller, amount, currency, reference, actor, note\n\
                    fund, , buyer_1, , 20.00, usd, , ,\n\
                    release, ord_1, , , , , , admin_1,";
        let results: Vec<Result<Command>> = CommandReader::new(data.as_bytes()).commands().collect();

        assert_eq!(results.len(), 2);
        let fund = results[0].as_ref().unwrap();
        assert_eq!(fund.op, CommandOp::Fund);
        assert_eq!(fund.amount, Some(dec!(20.00)));
        assert_eq!(fund.amount().unwrap().value(), 2000);
        assert_eq!(fund.currency().unwrap(), Currency::Usd);
        assert_eq!(fund.buyer_id().unwrap().as_str(), "buyer_1");
        assert!(fund.order_ref().is_err());

        let release = results[1].as_ref().unwrap();
        assert_eq!(release.op, CommandOp::Release);
        assert_eq!(release.order_ref().unwrap(), "ord_1");
        assert_eq!(release.actor(), "admin_1");
    }

    #[test]
    fn test_short_rows_default_to_empty() {
        let data = "op, order, buyer, seller, amount, currency, reference, actor, note\n\
                    release, ord_1";
        let results: Vec<Result<Command>> = CommandReader::new(data.as_bytes()).commands().collect();
        let release = results[0].as_ref().unwrap();
        assert_eq!(release.actor(), Command::DEFAULT_ACTOR);
        assert_eq!(release.note(), "");
        assert_eq!(release.reference(), None);
    }

    #[test]
    fn test_sub_cent_amount_rejected() {
        let data = "op, order, buyer, seller, amount, currency\ncharge, , buyer_1, , 1.005, USD";
        let results: Vec<Result<Command>> = CommandReader::new(data.as_bytes()).commands().collect();
        assert!(matches!(
            results[0].as_ref().unwrap().amount(),
            Err(SettlementError::ValidationError(_))
        ));
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "op, order\nteleport, ord_1";
        let results: Vec<Result<Command>> = CommandReader::new(data.as_bytes()).commands().collect();
        assert!(matches!(results[0], Err(SettlementError::CsvError(_))));
    }
}
