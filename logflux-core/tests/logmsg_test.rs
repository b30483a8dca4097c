use logflux_core::logmsg::{
    self, builtin, flags, get_value_handle, match_handle, LogMessage, MessageHandle,
    MsgFormatOptions, PathOptions,
};
use logflux_core::tags::TAG_ID_MAX;
use std::sync::Arc;

#[test]
fn new_message_without_format_handler_keeps_raw_bytes() {
    let raw = b"<13>Feb  5 12:00:01 host app[42]: something happened";
    let msg = LogMessage::new(raw, None, &MsgFormatOptions::default());
    assert_eq!(msg.get_value(builtin::MESSAGE), raw);
    assert!(msg.timestamps[1].is_set());
    let (ack, refs) = msg.ack_and_ref_counts();
    assert_eq!((ack, refs), (0, 1));
}

#[test]
fn format_handlers_take_over_parsing() {
    struct ColonFormat;

    impl logflux_core::MsgFormat for ColonFormat {
        fn parse(
            &self,
            _options: &MsgFormatOptions,
            data: &[u8],
            msg: &mut LogMessage,
        ) {
            let split = data.iter().position(|b| *b == b':').unwrap_or(0);
            msg.set_value(builtin::PROGRAM, &data[..split]);
            msg.set_value(builtin::MESSAGE, &data[split + 1..]);
        }
    }

    let options = MsgFormatOptions {
        format: Some(Arc::new(ColonFormat)),
    };
    let msg = LogMessage::new(b"cron:job done", None, &options);
    assert_eq!(msg.get_value(builtin::PROGRAM), b"cron");
    assert_eq!(msg.get_value(builtin::MESSAGE), b"job done");
}

#[test]
fn internal_and_mark_messages_carry_their_flags() {
    let msg = LogMessage::new_internal(38, "starting up");
    assert_eq!(msg.get_value(builtin::MESSAGE), b"starting up");
    assert_eq!(msg.get_value(builtin::PROGRAM), b"logflux");
    assert!(msg.flags() & flags::INTERNAL != 0);
    assert!(msg.flags() & flags::LOCAL != 0);

    let mark = LogMessage::new_mark();
    assert_eq!(mark.get_value(builtin::MESSAGE), b"-- MARK --");
    assert!(mark.flags() & flags::MARK != 0);
}

#[test]
fn set_value_overwrites_and_registers_dynamic_names() {
    let mut msg = LogMessage::new_empty();
    msg.set_value(builtin::HOST, b"gateway");
    assert_eq!(msg.get_value(builtin::HOST), b"gateway");
    msg.set_value(builtin::HOST, b"gateway-2");
    assert_eq!(msg.get_value(builtin::HOST), b"gateway-2");

    let handle = get_value_handle("APP.context_id");
    msg.set_value(handle, b"ctx-17");
    assert_eq!(msg.get_value_by_name("APP.context_id"), b"ctx-17");
}

#[test]
fn setting_program_clears_the_legacy_header_flag() {
    let mut msg = LogMessage::new_empty();
    msg.set_flag(flags::LEGACY_MSGHDR);
    msg.set_value(builtin::PROGRAM, b"sshd");
    assert!(msg.flags() & flags::LEGACY_MSGHDR == 0);
}

#[test]
fn matches_are_values_under_numbered_handles() {
    let mut msg = LogMessage::new_empty();
    msg.set_value(builtin::MESSAGE, b"user alice logged in");
    msg.set_match(0, b"whole");
    msg.set_match_indirect(1, builtin::MESSAGE, 0, 5, 5);
    assert_eq!(msg.get_match(0), b"whole");
    assert_eq!(msg.get_match(1), b"alice");
    assert_eq!(msg.num_matches(), 2);
    assert!(logmsg::is_handle_match(match_handle(1)));

    msg.clear_matches();
    assert_eq!(msg.num_matches(), 0);
    assert_eq!(msg.get_match(1), b"");
}

#[test]
fn tags_roundtrip_across_the_inline_boundary() {
    let mut msg = LogMessage::new_empty();
    for id in [0u16, 63, 64, TAG_ID_MAX] {
        assert!(!msg.is_tag_by_id(id));
        msg.set_tag_by_id(id);
        assert!(msg.is_tag_by_id(id));
    }
    msg.clear_tag_by_id(64);
    assert!(!msg.is_tag_by_id(64));
    assert!(msg.is_tag_by_id(63));
    assert!(msg.is_tag_by_id(TAG_ID_MAX));
}

#[test]
fn tag_names_are_shared_process_wide() {
    let mut msg = LogMessage::new_empty();
    msg.set_tag_by_name("syslog.selected");
    assert!(msg.is_tag_by_name("syslog.selected"));

    let mut printed = String::new();
    msg.print_tags(&mut printed);
    assert_eq!(printed, "syslog.selected");
}

#[test]
fn clone_shares_payload_until_either_side_writes() {
    let mut original = LogMessage::new_empty();
    original.set_value(builtin::MESSAGE, b"shared payload");
    original.set_tag_by_id(3);
    let original = Arc::new(original);

    let path = PathOptions::new();
    let clone = Arc::new(original.clone_cow(&path));
    assert_eq!(clone.get_value(builtin::MESSAGE), b"shared payload");
    assert!(clone.is_tag_by_id(3));
    assert!(clone.original().is_some());

    let mut writable = Arc::clone(&clone);
    let msg = LogMessage::make_writable(&mut writable, &path);
    msg.set_value(builtin::MESSAGE, b"diverged");

    assert_eq!(original.get_value(builtin::MESSAGE), b"shared payload");
    assert_eq!(writable.get_value(builtin::MESSAGE), b"diverged");
}

#[test]
fn clone_of_clone_redirects_to_the_root_original() {
    let original = Arc::new(LogMessage::new_empty());
    let path = PathOptions::new();
    let clone = Arc::new(original.clone_cow(&path));
    let clone_of_clone = clone.clone_cow(&path);

    let root = clone_of_clone.original().unwrap();
    assert!(Arc::ptr_eq(root, &original));
}

#[test]
fn acking_a_clone_acks_the_original() {
    let flow = PathOptions {
        ack_needed: true,
        flow_control_requested: true,
    };
    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let fired_in_handler = Arc::clone(&fired);

    let mut original = LogMessage::new_empty();
    original.set_ack_handler(logflux_core::AckHandler::Custom(Box::new(move |_| {
        fired_in_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    })));
    let original = Arc::new(original);
    original.add_ack(&flow);

    let clone = Arc::new(original.clone_cow(&flow));
    let (clone_acks, _) = clone.ack_and_ref_counts();
    assert_eq!(clone_acks, 1);

    clone.ack(&flow);
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn formats_structured_data_with_and_without_sequence_id() {
    let mut msg = LogMessage::new_empty();
    msg.set_value(get_value_handle(".SDATA.meta.sequenceId"), b"7");
    msg.set_value(get_value_handle(".SDATA.origin.ip"), b"1.2.3.4");

    let mut out = String::new();
    msg.format_sdata(&mut out, 0);
    assert_eq!(out, "[meta sequenceId=\"7\"][origin ip=\"1.2.3.4\"]");

    let mut msg = LogMessage::new_empty();
    msg.set_value(get_value_handle(".SDATA.origin.ip"), b"1.2.3.4");
    msg.format_sdata(&mut out, 9);
    assert_eq!(out, "[origin ip=\"1.2.3.4\"][meta sequenceId=\"9\"]");
}

#[test]
fn sdata_parameters_of_one_element_stay_contiguous() {
    let mut msg = LogMessage::new_empty();
    msg.set_value(get_value_handle(".SDATA.exampleSDID@0.iut"), b"3");
    msg.set_value(get_value_handle(".SDATA.origin.ip"), b"10.0.0.1");
    msg.set_value(get_value_handle(".SDATA.exampleSDID@0.eventSource"), b"app");

    let mut out = String::new();
    msg.format_sdata(&mut out, 0);
    assert_eq!(
        out,
        "[exampleSDID@0 eventSource=\"app\" iut=\"3\"][origin ip=\"10.0.0.1\"]"
    );
}

#[test]
fn sdata_values_are_escaped() {
    let mut msg = LogMessage::new_empty();
    msg.set_value(get_value_handle(".SDATA.x.quote"), b"say \"hi\" [now] \\ok");
    let mut out = String::new();
    msg.format_sdata(&mut out, 0);
    assert_eq!(out, "[x quote=\"say \\\"hi\\\" [now\\] \\\\ok\"]");
}

#[test]
fn clear_resets_to_a_fresh_message() {
    let mut msg = LogMessage::new_empty();
    msg.set_value(builtin::MESSAGE, b"to be discarded");
    msg.set_tag_by_id(7);
    msg.set_match(0, b"m");
    msg.clear();

    assert_eq!(msg.get_value(builtin::MESSAGE), b"");
    assert!(!msg.is_tag_by_id(7));
    assert_eq!(msg.num_matches(), 0);
    assert!(msg.flags() & flags::STATE_OWN_MASK == flags::STATE_OWN_MASK);
}

#[test]
fn break_ack_acks_and_strips_the_flag() {
    let path = PathOptions {
        ack_needed: true,
        flow_control_requested: false,
    };
    let msg = Arc::new(LogMessage::new_empty());
    msg.add_ack(&path);
    let downstream = msg.break_ack(&path);
    assert!(!downstream.ack_needed);
    let (acks, _) = msg.ack_and_ref_counts();
    assert_eq!(acks, 0);
}
