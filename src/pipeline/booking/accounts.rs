//! Working subset of the RRiF chart of accounts used by machine
//! bookings. The full client chart lives in the ERP; these are the
//! accounts the pipeline is allowed to propose.

/// Input VAT receivable (pretporez).
pub const INPUT_VAT: &str = "1230";
/// VAT payable on outgoing invoices.
pub const OUTPUT_VAT: &str = "2600";
/// VAT payable on reverse-charge acquisitions.
pub const OUTPUT_VAT_RC: &str = "2610";
/// Domestic supplier payables.
pub const SUPPLIERS_DOMESTIC: &str = "2200";
/// EU supplier payables.
pub const SUPPLIERS_EU: &str = "2210";
/// Cash register.
pub const CASH: &str = "1400";
/// Main bank account.
pub const BANK: &str = "1500";
/// Clearing account for unmatched statement lines.
pub const CLEARING: &str = "1090";
/// Default expense account when nothing better is known.
pub const EXPENSE_FALLBACK: &str = "4800";

const CHART: &[(&str, &str)] = &[
    ("1090", "Prijelazni račun"),
    ("1230", "Potraživanja od države — pretporez"),
    ("1400", "Gotovina u blagajni"),
    ("1500", "Žiro račun — poslovna banka"),
    ("2200", "Dobavljači u zemlji"),
    ("2210", "Dobavljači u EU"),
    ("2300", "Obveze za poreze i doprinose"),
    ("2600", "Obveza za PDV"),
    ("2610", "Obveza za PDV — prijenos porezne obveze"),
    ("2700", "Obveze prema zaposlenicima"),
    ("4000", "Materijalni troškovi"),
    ("4100", "Troškovi usluga"),
    ("4200", "Troškovi najma"),
    ("4300", "Troškovi prijevoza"),
    ("4400", "Troškovi energije"),
    ("4500", "Troškovi osoblja"),
    ("4600", "Amortizacija"),
    ("4700", "Troškovi reprezentacije"),
    ("4800", "Ostali troškovi poslovanja"),
    ("6200", "Prihodi od prodaje"),
    ("6600", "Ostali prihodi"),
];

pub fn account_name(account: &str) -> Option<&'static str> {
    CHART.iter().find(|(code, _)| *code == account).map(|(_, name)| *name)
}

pub fn is_known_account(account: &str) -> bool {
    account_name(account).is_some()
}

/// Expense accounts the classifier may pick from.
pub fn expense_accounts() -> Vec<&'static str> {
    CHART
        .iter()
        .map(|(code, _)| *code)
        .filter(|code| code.starts_with('4'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_lookup() {
        assert_eq!(account_name("2200"), Some("Dobavljači u zemlji"));
        assert!(is_known_account(INPUT_VAT));
        assert!(!is_known_account("9999"));
    }

    #[test]
    fn expense_accounts_are_class_4() {
        let accounts = expense_accounts();
        assert!(accounts.contains(&"4000"));
        assert!(accounts.iter().all(|a| a.starts_with('4')));
    }
}
