use proptest::prelude::*;
use usbmouse::report::{
    decode, decode_with, MotionAxis, MouseButton, RawReport, ReportEvent, ReportLayout,
};

fn raw_report() -> impl Strategy<Value = RawReport> {
    prop::array::uniform8(any::<u8>())
}

fn boot_layout() -> impl Strategy<Value = ReportLayout> {
    (0usize..8, 0usize..8, 0usize..8, 0usize..8)
        .prop_map(|(buttons, x, y, wheel)| ReportLayout { buttons, x, y, wheel })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn decoding_is_deterministic(raw in raw_report()) {
        prop_assert_eq!(decode(&raw), decode(&raw));
    }

    #[test]
    fn any_in_range_layout_decodes(layout in boot_layout(), raw in raw_report()) {
        prop_assert!(layout.validate().is_ok());
        let decoded = decode_with(&layout, &raw);
        prop_assert_eq!(decoded.x, raw[layout.x] as i8);
        prop_assert_eq!(decoded.wheel, raw[layout.wheel] as i8);
    }

    #[test]
    fn buttons_follow_their_own_bit(raw in raw_report()) {
        let decoded = decode(&raw);
        for (bit, button) in MouseButton::ALL.into_iter().enumerate() {
            prop_assert_eq!(decoded.is_pressed(button), raw[1] & (1 << bit) != 0);
        }
    }

    #[test]
    fn upper_button_bits_are_ignored(raw in raw_report(), noise in 0u8..16) {
        let mut noisy = raw;
        noisy[1] = (raw[1] & 0x0F) | (noise << 4);
        prop_assert_eq!(decode(&noisy), decode(&raw));
    }

    #[test]
    fn motion_is_twos_complement(x in any::<i8>(), y in any::<i8>(), wheel in any::<i8>()) {
        let raw = [0, 0, x as u8, 0, y as u8, 0, wheel as u8, 0];
        let decoded = decode(&raw);
        prop_assert_eq!(decoded.delta(MotionAxis::X), x);
        prop_assert_eq!(decoded.delta(MotionAxis::Y), y);
        prop_assert_eq!(decoded.delta(MotionAxis::Wheel), wheel);
    }

    #[test]
    fn padding_bytes_do_not_matter(raw in raw_report(), pad in raw_report()) {
        let mut padded = raw;
        for offset in [0, 3, 5, 7] {
            padded[offset] = pad[offset];
        }
        prop_assert_eq!(decode(&padded), decode(&raw));
    }

    #[test]
    fn events_cover_every_button_then_every_axis(raw in raw_report()) {
        let events: Vec<_> = decode(&raw).events().collect();
        prop_assert_eq!(events.len(), MouseButton::ALL.len() + MotionAxis::ALL.len());
        let (buttons, motion) = events.split_at(MouseButton::ALL.len());
        prop_assert!(buttons.iter().all(|e| matches!(e, ReportEvent::Button { .. })), "expected only Button events");
        prop_assert!(motion.iter().all(|e| matches!(e, ReportEvent::Motion { .. })), "expected only Motion events");
    }
}
