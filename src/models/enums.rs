//! Closed enumerations used across the system. Unknown values are
//! rejected on ingress, never coerced.

use serde::{Deserialize, Serialize};

/// Canonical document class catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocClass {
    InvoiceIn,
    InvoiceEu,
    InvoiceOut,
    BankStmt,
    PayrollInput,
    TravelOrder,
    CashRegister,
}

impl DocClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceIn => "invoice_in",
            Self::InvoiceEu => "invoice_eu",
            Self::InvoiceOut => "invoice_out",
            Self::BankStmt => "bank_stmt",
            Self::PayrollInput => "payroll_input",
            Self::TravelOrder => "travel_order",
            Self::CashRegister => "cash_register",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice_in" => Some(Self::InvoiceIn),
            "invoice_eu" => Some(Self::InvoiceEu),
            "invoice_out" => Some(Self::InvoiceOut),
            "bank_stmt" => Some(Self::BankStmt),
            "payroll_input" => Some(Self::PayrollInput),
            "travel_order" => Some(Self::TravelOrder),
            "cash_register" => Some(Self::CashRegister),
        _ => None,
        }
    }

    /// Day-first date convention applies to all classes; the hint exists so
    /// bank statement CSVs (ISO dates) skip ambiguity flagging.
    pub fn dates_are_day_first(&self) -> bool {
        !matches!(self, Self::BankStmt)
    }
}

/// Extraction fidelity tiers, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    StructuredXml,
    TemplateMatch,
    Regex,
    VisionOcr,
    Manual,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StructuredXml => "structured_xml",
            Self::TemplateMatch => "template_match",
            Self::Regex => "regex",
            Self::VisionOcr => "vision_ocr",
            Self::Manual => "manual",
        }
    }
}

/// Operator roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Accountant,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Accountant => "accountant",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "accountant" => Some(Self::Accountant),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// Approve / reject / correct bookings.
    pub fn can_review(&self) -> bool {
        matches!(self, Self::Admin | Self::Accountant)
    }

    /// Read the audit trail and manage the legal corpus.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_class_round_trips() {
        for class in [
            DocClass::InvoiceIn,
            DocClass::InvoiceEu,
            DocClass::InvoiceOut,
            DocClass::BankStmt,
            DocClass::PayrollInput,
            DocClass::TravelOrder,
            DocClass::CashRegister,
        ] {
            assert_eq!(DocClass::parse(class.as_str()), Some(class));
        }
        assert_eq!(DocClass::parse("unknown"), None);
    }

    #[test]
    fn tier_ordering_is_fidelity_order() {
        assert!(SourceTier::StructuredXml < SourceTier::TemplateMatch);
        assert!(SourceTier::TemplateMatch < SourceTier::Regex);
        assert!(SourceTier::Regex < SourceTier::VisionOcr);
        assert!(SourceTier::VisionOcr < SourceTier::Manual);
    }

    #[test]
    fn roles_gate_review() {
        assert!(Role::Admin.can_review());
        assert!(Role::Accountant.can_review());
        assert!(!Role::Assistant.can_review());
        assert!(!Role::Accountant.is_admin());
    }
}
