use crate::application::engine::BalanceRow;
use crate::domain::ledger::Role;
use crate::domain::money::{Currency, to_major};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct BalanceRecord<'a> {
    subject: &'a str,
    role: Role,
    currency: Currency,
    locked: Decimal,
    available: Decimal,
    settled: Decimal,
    total: Decimal,
}

/// Writes the balance report as CSV, amounts in major units.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_rows(&mut self, rows: &[BalanceRow]) -> Result<()> {
        for row in rows {
            let currency = row.currency;
            self.writer.serialize(BalanceRecord {
                subject: row.subject_id.as_str(),
                role: row.role,
                currency,
                locked: to_major(row.rollup.locked, currency),
                available: to_major(row.rollup.available, currency),
                settled: to_major(row.rollup.settled, currency),
                total: to_major(row.rollup.total, currency),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::{StatusRollup, SubjectId};

    #[test]
    fn test_writes_header_and_major_units() {
        let rows = vec![BalanceRow {
            subject_id: SubjectId::new("seller_1").unwrap(),
            role: Role::Seller,
            currency: Currency::Usd,
            rollup: StatusRollup {
                locked: 2550,
                available: 0,
                settled: -1005,
                total: 1545,
            },
        }];
        let mut out = Vec::new();
        BalanceWriter::new(&mut out).write_rows(&rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("subject,role,currency,locked,available,settled,total")
        );
        assert_eq!(lines.next(), Some("seller_1,seller,USD,25.5,0,-10.05,15.45"));
    }
}
