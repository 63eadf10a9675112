use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::Decimal;

use super::tax::TaxRule;
use crate::constants::CONSENT_DAYS_PER_MONTH;
use crate::error::{AppError, AppResult};
use crate::models::{Bill, BillPaymentPlan, PaymentPlan, RuleType};
use crate::money::{percent_of, round2};

/// Figures fixed at consent time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFigures {
    pub duration: i32,
    pub interest_amount: Decimal,
    pub interest_tax: Decimal,
    pub fees: Decimal,
    pub fees_tax: Decimal,
    pub payable_amount_using_pp: Decimal,
    pub emi: Decimal,
    /// Final installment, absorbing rounding.
    pub last_emi: Decimal,
}

impl PlanFigures {
    pub fn tax(&self) -> Decimal {
        self.interest_tax + self.fees_tax
    }

    pub fn consent_days(&self) -> i32 {
        CONSENT_DAYS_PER_MONTH * self.duration
    }
}

fn charge(kind: RuleType, rate: Decimal, base: Decimal) -> Decimal {
    match kind {
        RuleType::Percent => round2(percent_of(base, rate)),
        RuleType::Flat => round2(rate),
    }
}

pub fn compute_plan(plan: &PaymentPlan, patient_amount: Decimal, tax: &TaxRule) -> AppResult<PlanFigures> {
    if plan.duration < 1 {
        return Err(AppError::InvalidInput(
            "payment plan duration must be at least one month".to_string(),
        ));
    }
    if patient_amount <= Decimal::ZERO {
        return Err(AppError::InvalidAmount(
            "nothing to finance on this bill".to_string(),
        ));
    }

    let interest_amount = charge(plan.type_of_interest, plan.interest_rate, patient_amount);
    let fees = charge(plan.type_processing_fee, plan.other_fees, patient_amount);
    let interest_tax = if plan.interest_taxable {
        tax.apply_secondary(interest_amount)
    } else {
        Decimal::ZERO
    };
    let fees_tax = if plan.other_fees_taxable {
        tax.apply_secondary(fees)
    } else {
        Decimal::ZERO
    };

    let payable = round2(patient_amount + interest_amount + fees + interest_tax + fees_tax);
    let duration = Decimal::from(plan.duration);
    let emi = round2(payable / duration);
    let last_emi = payable - emi * (duration - Decimal::ONE);

    Ok(PlanFigures {
        duration: plan.duration,
        interest_amount,
        interest_tax,
        fees,
        fees_tax,
        payable_amount_using_pp: payable,
        emi,
        last_emi,
    })
}

/// Amount due for the 1-based installment `number`.
pub fn installment_amount(bpp: &BillPaymentPlan, number: i32) -> Decimal {
    if number >= bpp.duration {
        bpp.payable_amount_using_pp - bpp.emi * Decimal::from(bpp.duration - 1)
    } else {
        bpp.emi
    }
}

/// `count` dates on `day_of_month` starting at `start`, skipping months that lack the day.
pub fn installment_dates(start: NaiveDate, day_of_month: u32, count: usize) -> Vec<NaiveDate> {
    let first = start.with_day(1).unwrap_or(start);
    let mut dates = Vec::with_capacity(count);
    let mut step = 0u32;
    while dates.len() < count && step < (count as u32 + 1) * 12 {
        if let Some(month) = first.checked_add_months(Months::new(step)) {
            if let Some(date) = month.with_day(day_of_month) {
                if date >= start {
                    dates.push(date);
                }
            }
        }
        step += 1;
    }
    dates
}

/// The next `n` unpaid installment dates.
pub fn upcoming_emis(bpp: &BillPaymentPlan, n: usize) -> Vec<NaiveDate> {
    installment_dates(bpp.start_date, bpp.day_of_month as u32, bpp.duration.max(0) as usize)
        .into_iter()
        .skip(bpp.installments_paid.max(0) as usize)
        .take(n)
        .collect()
}

/// Date the next installment falls due, if any remain.
pub fn next_due_date(bpp: &BillPaymentPlan) -> Option<NaiveDate> {
    upcoming_emis(bpp, 1).into_iter().next()
}

/// Effect of a settled installment on its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallmentCredit {
    /// Already counted, or not the next unpaid installment.
    Ignored,
    Credited,
    PlanCompleted,
}

/// Credit settled installment `number` to the plan and its bill. Only the next unpaid
/// installment advances the plan; the bill completes together with the plan.
pub fn credit_installment(
    bpp: &mut BillPaymentPlan,
    bill: &mut Bill,
    number: i32,
    amount: Decimal,
    today: NaiveDate,
) -> InstallmentCredit {
    if number != bpp.installments_paid + 1 {
        return InstallmentCredit::Ignored;
    }
    bpp.installments_paid = number;
    bpp.paid_amount = round2(bpp.paid_amount + amount);
    bill.paid_amount = round2((bill.paid_amount + amount).min(bill.patient_amount));
    if bpp.installments_paid >= bpp.duration {
        bpp.active = false;
        super::bill::mark_completed(bill, today);
        return InstallmentCredit::PlanCompleted;
    }
    InstallmentCredit::Credited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::AuditEnvelope;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn plan(duration: i32, rate: Decimal, fee: Decimal) -> PaymentPlan {
        PaymentPlan {
            audit: AuditEnvelope::stamp_create(&RequestContext::system(Uuid::new_v4())),
            name: "6 months".to_string(),
            duration,
            interest_rate: rate,
            type_of_interest: RuleType::Percent,
            other_fees: fee,
            type_processing_fee: RuleType::Flat,
            interest_taxable: false,
            other_fees_taxable: true,
            start_date: None,
            end_date: None,
            active: true,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn emi_math_and_rounding() {
        let figures = compute_plan(&plan(3, dec!(6), dec!(10)), dec!(100), &TaxRule::default()).unwrap();
        assert_eq!(figures.interest_amount, dec!(6));
        assert_eq!(figures.fees, dec!(10));
        assert_eq!(figures.fees_tax, dec!(0.50));
        assert_eq!(figures.payable_amount_using_pp, dec!(116.50));
        assert_eq!(figures.emi, dec!(38.83));
        assert_eq!(figures.last_emi, dec!(38.84));
        assert_eq!(figures.emi * dec!(2) + figures.last_emi, figures.payable_amount_using_pp);
        assert_eq!(figures.consent_days(), 90);
    }

    #[test]
    fn rejects_zero_duration() {
        assert!(compute_plan(&plan(0, dec!(0), dec!(0)), dec!(100), &TaxRule::default()).is_err());
    }

    #[test]
    fn installment_dates_skip_short_months() {
        let dates = installment_dates(d(2025, 1, 15), 31, 3);
        assert_eq!(dates, vec![d(2025, 1, 31), d(2025, 3, 31), d(2025, 5, 31)]);
    }

    fn on_plan(ctx: &RequestContext) -> (BillPaymentPlan, Bill) {
        let day = d(2025, 1, 1);
        let bill = Bill {
            audit: AuditEnvelope::stamp_create(ctx),
            display_id: "BL-7".to_string(),
            resident_id: Uuid::new_v4(),
            location_id: None,
            service_description: None,
            service_date: day,
            statement_date: day,
            due_date: day,
            paid_date: None,
            status: crate::models::BillStatus::OnPp,
            currency: "USD".to_string(),
            tax_state: None,
            total_charges: dec!(200),
            insurance_paid: Decimal::ZERO,
            patient_amount: dec!(200),
            other_discount: Decimal::ZERO,
            other_adjustment: Decimal::ZERO,
            other_writeoff: Decimal::ZERO,
            other_tax: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            cancellation_reason: None,
            cancellation_code: None,
        };
        let bpp = BillPaymentPlan {
            audit: AuditEnvelope::stamp_create(ctx),
            bill_id: bill.audit.id,
            payment_plan_id: Uuid::new_v4(),
            duration: 2,
            interest_rate: Decimal::ZERO,
            type_of_interest: RuleType::Percent,
            fees: Decimal::ZERO,
            interest_amount: Decimal::ZERO,
            tax: Decimal::ZERO,
            payable_amount_using_pp: dec!(200),
            emi: dec!(100),
            paid_amount: Decimal::ZERO,
            installments_paid: 0,
            start_date: day,
            day_of_month: 1,
            consent_id: "consent-1".to_string(),
            payment_method: crate::models::PaymentMethod::CreditCard,
            consent_response: serde_json::Value::Null,
            last_charged_on: None,
            active: true,
        };
        (bpp, bill)
    }

    #[test]
    fn installment_credit_counts_each_number_once() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let (mut bpp, mut bill) = on_plan(&ctx);

        let first = credit_installment(&mut bpp, &mut bill, 1, dec!(100), d(2025, 1, 1));
        let replay = credit_installment(&mut bpp, &mut bill, 1, dec!(100), d(2025, 1, 2));

        assert_eq!(first, InstallmentCredit::Credited);
        assert_eq!(replay, InstallmentCredit::Ignored);
        assert_eq!(bpp.installments_paid, 1);
        assert_eq!(bpp.paid_amount, dec!(100));
        assert_eq!(bill.paid_amount, dec!(100));
        assert!(bpp.active);
    }

    #[test]
    fn last_installment_completes_plan_and_bill() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let (mut bpp, mut bill) = on_plan(&ctx);

        assert_eq!(
            credit_installment(&mut bpp, &mut bill, 2, dec!(100), d(2025, 2, 1)),
            InstallmentCredit::Ignored
        );
        credit_installment(&mut bpp, &mut bill, 1, dec!(100), d(2025, 1, 1));
        let last = credit_installment(&mut bpp, &mut bill, 2, dec!(100), d(2025, 2, 1));

        assert_eq!(last, InstallmentCredit::PlanCompleted);
        assert!(!bpp.active);
        assert_eq!(bill.status, crate::models::BillStatus::Completed);
        assert_eq!(bill.paid_date, Some(d(2025, 2, 1)));
    }

    #[test]
    fn installment_dates_start_next_month_when_day_passed() {
        let dates = installment_dates(d(2025, 1, 20), 5, 2);
        assert_eq!(dates, vec![d(2025, 2, 5), d(2025, 3, 5)]);
    }
}
