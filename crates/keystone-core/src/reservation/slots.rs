use chrono::{NaiveTime, Timelike};

use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{AmenityBlackoutPeriod, AmenitySlot, SlotGenerationRequest};

/// A slot to upsert for one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSlot {
    pub slot_date: chrono::NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub duration_minutes: i32,
}

pub fn validate_request(req: &SlotGenerationRequest) -> AppResult<()> {
    req.validate()?;
    if req.from_date > req.to_date {
        return Err(AppError::InvalidInput(
            "from_date must not be after to_date".to_string(),
        ));
    }
    if req.operating_start_time >= req.operating_end_time {
        return Err(AppError::InvalidInput(
            "operating_start_time must be before operating_end_time".to_string(),
        ));
    }
    Ok(())
}

fn minutes_of(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight() / 60
}

fn time_at(minutes: u32) -> Option<NaiveTime> {
    NaiveTime::from_num_seconds_from_midnight_opt(minutes * 60, 0)
}

/// Every `interval_minutes` window inside [operating_start, operating_end) for each date.
pub fn plan_slots(req: &SlotGenerationRequest) -> AppResult<Vec<PlannedSlot>> {
    validate_request(req)?;

    let interval = req.interval_minutes as u32;
    let open = minutes_of(req.operating_start_time);
    let close = minutes_of(req.operating_end_time);

    let mut windows = Vec::new();
    let mut start = open;
    while start + interval <= close {
        if let (Some(s), Some(e)) = (time_at(start), time_at(start + interval)) {
            windows.push((s, e));
        }
        start += interval;
    }

    let mut planned = Vec::new();
    for date in req.from_date.iter_days().take_while(|d| *d <= req.to_date) {
        for (s, e) in &windows {
            planned.push(PlannedSlot {
                slot_date: date,
                start: *s,
                end: *e,
                duration_minutes: req.interval_minutes,
            });
        }
    }
    Ok(planned)
}

/// Mark slots covered by any blackout unavailable. Returns how many changed.
pub fn apply_blackouts(slots: &mut [AmenitySlot], blackouts: &[AmenityBlackoutPeriod]) -> usize {
    let mut changed = 0;
    for slot in slots.iter_mut().filter(|s| s.is_available) {
        let blocked = blackouts.iter().any(|b| {
            b.amenity_id == slot.amenity_id
                && b.covers(slot.slot_date, slot.slot_start_time, slot.slot_end_time)
        });
        if blocked {
            slot.is_available = false;
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::AuditEnvelope;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn request(interval: i32) -> SlotGenerationRequest {
        SlotGenerationRequest {
            amenity_id: Uuid::new_v4(),
            from_date: d(2025, 1, 10),
            to_date: d(2025, 1, 11),
            operating_start_time: t(9, 0),
            operating_end_time: t(12, 30),
            interval_minutes: interval,
            max_concurrent_bookings: 2,
            delete_existing: false,
        }
    }

    #[test]
    fn windows_fit_inside_operating_hours() {
        let planned = plan_slots(&request(60)).unwrap();
        // 09-10, 10-11, 11-12 on two days; 12:00-13:00 does not fit
        assert_eq!(planned.len(), 6);
        assert_eq!(planned[2].start, t(11, 0));
        assert_eq!(planned[2].end, t(12, 0));
        assert_eq!(planned[3].slot_date, d(2025, 1, 11));
    }

    #[test]
    fn rejects_interval_out_of_range() {
        assert!(plan_slots(&request(10)).is_err());
        assert!(plan_slots(&request(481)).is_err());
    }

    #[test]
    fn rejects_zero_capacity_as_invalid_input() {
        let mut req = request(30);
        req.max_concurrent_bookings = 0;
        assert!(matches!(
            validate_request(&req),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn blackout_marks_intersecting_slots() {
        let ctx = RequestContext::system(Uuid::new_v4());
        let req = request(60);
        let mut slots: Vec<AmenitySlot> = plan_slots(&req)
            .unwrap()
            .into_iter()
            .map(|p| AmenitySlot {
                audit: AuditEnvelope::stamp_create(&ctx),
                amenity_id: req.amenity_id,
                slot_date: p.slot_date,
                slot_start_time: p.start,
                slot_end_time: p.end,
                slot_duration_minutes: p.duration_minutes,
                is_available: true,
                total_bookings: 0,
                max_concurrent_bookings: 2,
            })
            .collect();
        let blackout = AmenityBlackoutPeriod {
            audit: AuditEnvelope::stamp_create(&ctx),
            amenity_id: req.amenity_id,
            start_date: d(2025, 1, 10),
            end_date: d(2025, 1, 10),
            start_time: Some(t(10, 30)),
            end_time: Some(t(11, 30)),
            reason: "maintenance".to_string(),
        };

        let changed = apply_blackouts(&mut slots, &[blackout]);

        assert_eq!(changed, 2);
        assert!(slots[0].is_available);
        assert!(!slots[1].is_available);
        assert!(!slots[2].is_available);
        assert!(slots[4].is_available);
    }
}
