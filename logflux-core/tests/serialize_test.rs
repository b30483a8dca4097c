use logflux_core::addr::SenderAddr;
use logflux_core::logmsg::{builtin, get_value_handle, LogMessage};
use logflux_core::nvtable::NvTable;
use logflux_core::serialize::{ArchiveReader, ArchiveWriter};
use logflux_core::stamp::{Stamp, TS_RECVD, TS_STAMP};
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddrV4};

fn serialize_msg(msg: &LogMessage) -> Vec<u8> {
    let mut writer = ArchiveWriter::new(Vec::new());
    msg.serialize(&mut writer).unwrap();
    writer.into_inner()
}

fn deserialize_msg(bytes: &[u8]) -> LogMessage {
    let mut reader = ArchiveReader::new(Cursor::new(bytes));
    LogMessage::deserialize(&mut reader).unwrap()
}

fn sample_message() -> LogMessage {
    let mut msg = LogMessage::new_empty();
    msg.pri = 165;
    msg.rcptid = 99_0001;
    msg.timestamps[TS_STAMP] = Stamp {
        sec: 1_700_000_000,
        usec: 123_456,
        zone_offset: 3600,
    };
    msg.timestamps[TS_RECVD] = Stamp {
        sec: 1_700_000_001,
        usec: 654_321,
        zone_offset: 3600,
    };
    msg.set_saddr(Some(SenderAddr::Inet(SocketAddrV4::new(
        Ipv4Addr::new(10, 1, 2, 3),
        514,
    ))));
    msg.set_value(builtin::HOST, b"web-1");
    msg.set_value(builtin::PROGRAM, b"nginx");
    msg.set_value(builtin::MESSAGE, b"GET /index.html 200");
    msg.set_value(get_value_handle("HTTP.status"), b"200");
    msg.set_value(get_value_handle(".SDATA.origin.ip"), b"10.1.2.3");
    msg.set_match(0, b"GET");
    msg.set_tag_by_name("http.access");
    msg
}

fn assert_same_message(a: &LogMessage, b: &LogMessage) {
    assert_eq!(a.pri, b.pri);
    assert_eq!(a.rcptid, b.rcptid);
    assert_eq!(a.timestamps[TS_STAMP], b.timestamps[TS_STAMP]);
    assert_eq!(a.timestamps[TS_RECVD], b.timestamps[TS_RECVD]);
    assert_eq!(a.saddr(), b.saddr());
    assert_eq!(a.num_matches(), b.num_matches());

    for handle in [builtin::HOST, builtin::PROGRAM, builtin::MESSAGE] {
        assert_eq!(a.get_value(handle), b.get_value(handle));
    }
    assert_eq!(
        a.get_value_by_name("HTTP.status"),
        b.get_value_by_name("HTTP.status")
    );
    assert_eq!(
        a.get_value_by_name(".SDATA.origin.ip"),
        b.get_value_by_name(".SDATA.origin.ip")
    );

    let mut sdata_a = String::new();
    let mut sdata_b = String::new();
    a.format_sdata(&mut sdata_a, 0);
    b.format_sdata(&mut sdata_b, 0);
    assert_eq!(sdata_a, sdata_b);

    let mut tags_a = String::new();
    let mut tags_b = String::new();
    a.print_tags(&mut tags_a);
    b.print_tags(&mut tags_b);
    assert_eq!(tags_a, tags_b);
}

#[test]
fn current_version_roundtrips() {
    let msg = sample_message();
    let bytes = serialize_msg(&msg);
    let restored = deserialize_msg(&bytes);
    assert_same_message(&msg, &restored);

    // serialize ∘ deserialize is idempotent from the first generation on
    let bytes_again = serialize_msg(&restored);
    let restored_again = deserialize_msg(&bytes_again);
    assert_same_message(&restored, &restored_again);
}

#[test]
fn unsupported_versions_are_rejected() {
    for version in [5u8, 24, 200] {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_u8(version).unwrap();
        writer.write_u64(0).unwrap();
        let mut reader = ArchiveReader::new(Cursor::new(writer.into_inner()));
        assert!(LogMessage::deserialize(&mut reader).is_err());
    }
}

fn write_stamp64(writer: &mut ArchiveWriter<Vec<u8>>, sec: u64, usec: u32, zone: u32) {
    writer.write_u64(sec).unwrap();
    writer.write_u32(usec).unwrap();
    writer.write_u32(zone).unwrap();
}

/// A hand-built version 12 record: value list, SD data and tags, no
/// payload table.
fn craft_v12_record() -> Vec<u8> {
    let mut w = ArchiveWriter::new(Vec::new());
    w.write_u8(12).unwrap();
    w.write_u32(0).unwrap(); // flags
    w.write_u16(165).unwrap(); // pri
    w.write_cstring(b"s_net").unwrap(); // SOURCE
    w.write_u16(0).unwrap(); // no sender address
    write_stamp64(&mut w, 1_600_000_000, 1, 7200);
    write_stamp64(&mut w, 1_600_000_002, 2, 7200);
    // tags
    w.write_cstring(b"legacy.tag").unwrap();
    w.write_cstring(b"").unwrap();
    // HOST, HOST_FROM, PROGRAM, MESSAGE
    w.write_cstring(b"old-host").unwrap();
    w.write_cstring(b"relay-9").unwrap();
    w.write_cstring(b"crond").unwrap();
    w.write_cstring(b"job finished").unwrap();
    w.write_cstring(b"1234").unwrap(); // PID
    w.write_cstring(b"ID47").unwrap(); // MSGID
    w.write_u8(1).unwrap(); // num_matches
    w.write_u8(0).unwrap(); // direct match
    w.write_cstring(b"finished").unwrap();
    // dynamic values
    w.write_cstring(b"APP.tenant").unwrap();
    w.write_cstring(b"blue").unwrap();
    w.write_cstring(b"").unwrap();
    w.write_cstring(b"").unwrap();
    // SD data: [timeQuality tzKnown="1"]
    w.write_cstring(b"timeQuality").unwrap();
    w.write_cstring(b"tzKnown").unwrap();
    w.write_cstring(b"1").unwrap();
    w.write_cstring(b"").unwrap();
    w.write_cstring(b"").unwrap();
    w.write_cstring(b"").unwrap();
    w.into_inner()
}

#[test]
fn version_12_upgrades_through_the_current_version() {
    let restored = deserialize_msg(&craft_v12_record());
    assert_eq!(restored.pri, 165);
    assert_eq!(restored.get_value(builtin::HOST), b"old-host");
    assert_eq!(restored.get_value(builtin::PROGRAM), b"crond");
    assert_eq!(restored.get_value(builtin::MESSAGE), b"job finished");
    assert_eq!(restored.get_value(builtin::PID), b"1234");
    assert_eq!(restored.get_value(builtin::MSGID), b"ID47");
    assert_eq!(restored.get_value(builtin::SOURCE), b"s_net");
    assert_eq!(restored.get_value_by_name("APP.tenant"), b"blue");
    assert_eq!(restored.get_match(0), b"finished");
    assert!(restored.is_tag_by_name("legacy.tag"));

    let mut sdata = String::new();
    restored.format_sdata(&mut sdata, 0);
    assert_eq!(sdata, "[timeQuality tzKnown=\"1\"]");

    // upgrading: the reserialized form must load back identically
    let reserialized = serialize_msg(&restored);
    let upgraded = deserialize_msg(&reserialized);
    assert_same_message(&restored, &upgraded);
}

/// A hand-built version 0 record with the legacy `prog[pid]:` header still
/// embedded in the message body.
fn craft_v0_record() -> Vec<u8> {
    let mut w = ArchiveWriter::new(Vec::new());
    w.write_u8(0).unwrap();
    w.write_u8(0).unwrap(); // flags
    w.write_u8(13).unwrap(); // pri
    w.write_cstring(b"s_local").unwrap(); // SOURCE
    w.write_u16(0).unwrap(); // no sender address
    for _ in 0..2 {
        w.write_u32(940_000_000).unwrap(); // 32-bit seconds
        w.write_u32(0).unwrap();
        w.write_u32(0).unwrap();
    }
    w.write_cstring(b"Oct 16 00:26:40").unwrap(); // the dropped date field
    w.write_cstring(b"myhost").unwrap();
    w.write_cstring(b"myhost").unwrap();
    w.write_cstring(b"").unwrap(); // PROGRAM came embedded in MESSAGE
    w.write_cstring(b"app[42]: the actual payload").unwrap();
    w.write_u8(0).unwrap(); // num_matches
    w.into_inner()
}

#[test]
fn version_0_extracts_the_legacy_program_header() {
    let restored = deserialize_msg(&craft_v0_record());
    assert_eq!(restored.pri, 13);
    assert_eq!(restored.get_value(builtin::PROGRAM), b"app");
    // the PID slot is reset after the header split, matching the old loader
    assert_eq!(restored.get_value(builtin::PID), b"");
    assert_eq!(restored.get_value(builtin::MESSAGE), b"the actual payload");
    assert_eq!(restored.timestamps[TS_STAMP].sec, 940_000_000);

    let reserialized = serialize_msg(&restored);
    let upgraded = deserialize_msg(&reserialized);
    assert_same_message(&restored, &upgraded);
}

#[test]
fn nvtable_blob_roundtrips_with_indirect_entries() {
    let registry = logflux_core::logmsg::registry();
    let mut table = NvTable::new(8);
    table.add_value(builtin::MESSAGE, b"MESSAGE", b"abcdef").unwrap();
    let dynamic = get_value_handle("ROUNDTRIP.value");
    table.add_value(dynamic, b"ROUNDTRIP.value", b"xyz").unwrap();
    table
        .add_value_indirect(get_value_handle("ROUNDTRIP.slice"), b"ROUNDTRIP.slice", builtin::MESSAGE, 0, 2, 3)
        .unwrap();

    let mut writer = ArchiveWriter::new(Vec::new());
    table.serialize(&mut writer).unwrap();
    let mut reader = ArchiveReader::new(Cursor::new(writer.into_inner()));
    let mut restored = NvTable::deserialize(&mut reader).unwrap();
    restored.update_ids(registry);

    assert_eq!(restored.get_value(builtin::MESSAGE), b"abcdef");
    assert_eq!(restored.get_value(dynamic), b"xyz");
    assert_eq!(
        restored.get_value(get_value_handle("ROUNDTRIP.slice")),
        b"cde"
    );
}
