//! Defines the camera's GATT surface and the byte layouts written to it.
//!
//! Layout reference: https://github.com/whc2001/ILCE7M3ExternalGps/blob/main/PROTOCOL_EN.md

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use uuid::{uuid, Uuid};

use crate::location::LocationFix;

/// Service carrying the location characteristics.
pub const LOCATION_SERVICE_UUID: Uuid = uuid!("8000dd00-dd00-ffff-ffff-ffffffffffff");

/// Service carrying the time sync characteristic.
pub const CONTROL_SERVICE_UUID: Uuid = uuid!("8000cc00-cc00-ffff-ffff-ffffffffffff");

/// Characteristic location packets are written to.
pub const LOCATION_CHAR_UUID: Uuid = uuid!("0000dd11-0000-1000-8000-00805f9b34fb");

/// Characteristic whose value tells whether the camera expects timezone and DST data.
pub const CAPABILITY_CHAR_UUID: Uuid = uuid!("0000dd21-0000-1000-8000-00805f9b34fb");

/// Characteristic reporting whether location linkage is enabled in the camera menu.
pub const LOCATION_STATUS_CHAR_UUID: Uuid = uuid!("0000dd01-0000-1000-8000-00805f9b34fb");

/// Needed by some cameras before they accept location writes.
pub const GPS_UNLOCK_CHAR_UUID: Uuid = uuid!("0000dd30-0000-1000-8000-00805f9b34fb");

/// Written after the unlock is acknowledged.
pub const GPS_LOCK_CHAR_UUID: Uuid = uuid!("0000dd31-0000-1000-8000-00805f9b34fb");

/// Characteristic time sync packets are written to.
pub const TIME_SYNC_CHAR_UUID: Uuid = uuid!("0000cc13-0000-1000-8000-00805f9b34fb");

/// Value written to both the unlock and the lock characteristic.
pub const GPS_ENABLE_COMMAND: [u8; 1] = [0x01];

/// MTU requested after connecting; the value the vendor app uses.
pub const DEFAULT_REQUESTED_MTU: u16 = 158;

/// Length of a location packet carrying timezone and DST offsets.
pub const LOCATION_PACKET_LEN_WITH_TZ: usize = 95;

/// Length of a location packet without the trailing offsets.
pub const LOCATION_PACKET_LEN: usize = 91;

/// Length of a time sync packet.
pub const TIME_SYNC_PACKET_LEN: usize = 13;

/// Per-device transmission flags negotiated from the capability characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocationConfig {
    pub include_timezone_and_dst: bool,
}

impl Default for LocationConfig {
    // Cameras that expose no capability characteristic accept the long packet.
    fn default() -> Self {
        LocationConfig {
            include_timezone_and_dst: true,
        }
    }
}

/// Offsets of the phone's timezone, split the way the camera wants them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ZoneInfo {
    /// Standard offset from UTC in minutes, excluding daylight saving.
    pub utc_offset_minutes: i16,
    /// Daylight saving offset currently in effect, in minutes.
    pub dst_offset_minutes: i16,
}

impl ZoneInfo {
    /// Derives the offsets of the local timezone at the current instant.
    ///
    /// The standard offset is the smaller of the offsets in effect in January and July, which
    /// holds in both hemispheres.
    pub fn local() -> Self {
        let now = Local::now();
        let current = now.offset().local_minus_utc();

        let offset_on = |month: u32| {
            Local
                .with_ymd_and_hms(now.year(), month, 1, 12, 0, 0)
                .single()
                .map(|d| d.offset().local_minus_utc())
        };
        let standard = match (offset_on(1), offset_on(7)) {
            (Some(january), Some(july)) => january.min(july),
            _ => current,
        };

        ZoneInfo {
            utc_offset_minutes: (standard / 60) as i16,
            dst_offset_minutes: ((current - standard) / 60) as i16,
        }
    }
}

/// A wall clock reading together with the zone it was taken in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZonedTime {
    pub local: NaiveDateTime,
    pub zone: ZoneInfo,
}

impl ZonedTime {
    pub fn now() -> Self {
        ZonedTime {
            local: Local::now().naive_local(),
            zone: ZoneInfo::local(),
        }
    }
}

/*
+-----+--------+------+------+---------+-----+-----+------+-----+-----+-----+-----+---------+--------+--------+
| LEN | FIXED  | TYPE | ZERO | FIXED   | LAT | LNG | YEAR | MON | DAY | HR  | MIN | SEC     | ZEROS  | TZ/DST |
+-----+--------+------+------+---------+-----+-----+------+-----+-----+-----+-----+---------+--------+--------+
|  2  | 3      |  1   |  1   | 4       |  4  |  4  |  2   |  1  |  1  |  1  |  1  |  1      | 65     | 2 + 2  |
+-----+--------+------+------+---------+-----+-----+------+-----+-----+-----+-----+---------+--------+--------+

All multi-byte fields big endian. LEN excludes itself. LAT/LNG are degrees * 1e7 as signed
integers. The date is UTC. TYPE is 0x03 when the TZ/DST trailer is present, 0x00 otherwise.
*/
/// Encodes `fix` into the camera's location packet.
///
/// The timezone and DST trailer is appended only when `config.include_timezone_and_dst` is set.
pub fn encode_location_packet(fix: &LocationFix, config: &LocationConfig, zone: &ZoneInfo) -> Vec<u8> {
    let len = if config.include_timezone_and_dst {
        LOCATION_PACKET_LEN_WITH_TZ
    } else {
        LOCATION_PACKET_LEN
    };
    let mut data = vec![0u8; len];

    BigEndian::write_u16(&mut data[0..2], (len - 2) as u16);
    BigEndian::write_u24(&mut data[2..5], 0x0802fc);
    data[5] = if config.include_timezone_and_dst { 0x03 } else { 0x00 };
    data[6] = 0x00;
    BigEndian::write_u32(&mut data[7..11], 0x0010_1010);

    BigEndian::write_i32(&mut data[11..15], scale_coordinate(fix.latitude));
    BigEndian::write_i32(&mut data[15..19], scale_coordinate(fix.longitude));

    let utc = DateTime::<Utc>::from_timestamp_millis(fix.timestamp_millis).unwrap_or_default();
    BigEndian::write_u16(&mut data[19..21], utc.year() as u16);
    data[21] = utc.month() as u8;
    data[22] = utc.day() as u8;
    data[23] = utc.hour() as u8;
    data[24] = utc.minute() as u8;
    data[25] = utc.second() as u8;

    // Zeros from 26 to 90.

    if config.include_timezone_and_dst {
        BigEndian::write_i16(&mut data[91..93], zone.utc_offset_minutes);
        BigEndian::write_i16(&mut data[93..95], zone.dst_offset_minutes);
    }

    data
}

fn scale_coordinate(degrees: f64) -> i32 {
    (degrees * 10_000_000f64).round() as i32
}

/*
+-----+------+------+-----+-----+-----+-----+-----+-----+------+------+
| LEN | ZERO | YEAR | MON | DAY | HR  | MIN | SEC | DST | TZ H | TZ M |
+-----+------+------+-----+-----+-----+-----+-----+-----+------+------+
| 1   | 2    | 2    | 1   | 1   | 1   | 1   | 1   | 1   | 1    | 1    |
+-----+------+------+-----+-----+-----+-----+-----+-----+------+------+

LEN excludes itself. The date is local wall time. TZ H is the signed hour part of the standard
offset and TZ M the absolute minute remainder.
*/
/// Encodes `time` into the camera's time sync packet.
pub fn encode_time_sync_packet(time: &ZonedTime) -> Vec<u8> {
    let mut data = vec![0u8; TIME_SYNC_PACKET_LEN];

    data[0] = (TIME_SYNC_PACKET_LEN - 1) as u8;
    BigEndian::write_u16(&mut data[3..5], time.local.year() as u16);
    data[5] = time.local.month() as u8;
    data[6] = time.local.day() as u8;
    data[7] = time.local.hour() as u8;
    data[8] = time.local.minute() as u8;
    data[9] = time.local.second() as u8;
    data[10] = u8::from(time.zone.dst_offset_minutes != 0);
    data[11] = (time.zone.utc_offset_minutes / 60) as i8 as u8;
    data[12] = (time.zone.utc_offset_minutes % 60).unsigned_abs() as u8;

    data
}

/// Returns whether a capability read response asks for the timezone and DST trailer.
///
/// Responses shorter than 5 bytes are treated as "unsupported".
pub fn has_timezone_dst_flag(value: &[u8]) -> bool {
    value.len() >= 5 && (value[4] & 0x02) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fix(latitude: f64, longitude: f64, timestamp_millis: i64) -> LocationFix {
        LocationFix {
            latitude,
            longitude,
            altitude: None,
            accuracy_meters: 5.0,
            timestamp_millis,
            bearing: None,
            speed: None,
        }
    }

    fn decode_location_packet(data: &[u8]) -> (f64, f64, DateTime<Utc>, Option<ZoneInfo>) {
        let latitude = BigEndian::read_i32(&data[11..15]) as f64 / 10_000_000f64;
        let longitude = BigEndian::read_i32(&data[15..19]) as f64 / 10_000_000f64;
        let time = Utc
            .with_ymd_and_hms(
                BigEndian::read_u16(&data[19..21]) as i32,
                data[21] as u32,
                data[22] as u32,
                data[23] as u32,
                data[24] as u32,
                data[25] as u32,
            )
            .unwrap();
        let zone = (data[5] == 0x03).then(|| ZoneInfo {
            utc_offset_minutes: BigEndian::read_i16(&data[91..93]),
            dst_offset_minutes: BigEndian::read_i16(&data[93..95]),
        });
        (latitude, longitude, time, zone)
    }

    #[test]
    fn test_location_packet_with_timezone_matches_golden_bytes() {
        // 2024-03-15T10:30:45Z
        let packet = encode_location_packet(
            &fix(35.6586, 139.7454, 1_710_498_645_000),
            &LocationConfig {
                include_timezone_and_dst: true,
            },
            &ZoneInfo {
                utc_offset_minutes: 540,
                dst_offset_minutes: 0,
            },
        );

        let mut expected = vec![
            0x00, 0x5d, 0x08, 0x02, 0xfc, 0x03, 0x00, 0x00, 0x10, 0x10, 0x10, // header
            0x15, 0x41, 0x12, 0x10, // latitude
            0x53, 0x4b, 0x74, 0xb0, // longitude
            0x07, 0xe8, 0x03, 0x0f, 0x0a, 0x1e, 0x2d, // date
        ];
        expected.resize(LOCATION_PACKET_LEN, 0);
        expected.extend_from_slice(&[0x02, 0x1c, 0x00, 0x00]);

        assert_eq!(packet, expected);
    }

    #[test]
    fn test_location_packet_without_timezone_matches_golden_bytes() {
        // 2023-12-01T23:59:05Z, southern and eastern hemisphere.
        let packet = encode_location_packet(
            &fix(-33.8568, 151.2153, 1_701_475_145_000),
            &LocationConfig {
                include_timezone_and_dst: false,
            },
            &ZoneInfo {
                utc_offset_minutes: 600,
                dst_offset_minutes: 60,
            },
        );

        let mut expected = vec![
            0x00, 0x59, 0x08, 0x02, 0xfc, 0x00, 0x00, 0x00, 0x10, 0x10, 0x10, // header
            0xeb, 0xd1, 0xdc, 0xc0, // latitude
            0x5a, 0x21, 0x9f, 0xa8, // longitude
            0x07, 0xe7, 0x0c, 0x01, 0x17, 0x3b, 0x05, // date
        ];
        expected.resize(LOCATION_PACKET_LEN, 0);

        assert_eq!(packet, expected);
    }

    #[test]
    fn test_location_packet_numeric_fields_survive_decode() {
        let zone = ZoneInfo {
            utc_offset_minutes: -300,
            dst_offset_minutes: 60,
        };
        let packet = encode_location_packet(
            &fix(40.7484405, -73.9856644, 1_710_498_645_000),
            &LocationConfig::default(),
            &zone,
        );

        let (latitude, longitude, time, decoded_zone) = decode_location_packet(&packet);
        assert!((latitude - 40.7484405).abs() < 1e-7);
        assert!((longitude - -73.9856644).abs() < 1e-7);
        assert_eq!(time.timestamp_millis(), 1_710_498_645_000);
        assert_eq!(decoded_zone, Some(zone));
    }

    #[test]
    fn test_time_sync_packet_matches_golden_bytes() {
        let time = ZonedTime {
            local: NaiveDate::from_ymd_opt(2024, 7, 1)
                .unwrap()
                .and_hms_opt(8, 5, 9)
                .unwrap(),
            zone: ZoneInfo {
                utc_offset_minutes: -300,
                dst_offset_minutes: 60,
            },
        };

        assert_eq!(
            encode_time_sync_packet(&time),
            vec![0x0c, 0x00, 0x00, 0x07, 0xe8, 0x07, 0x01, 0x08, 0x05, 0x09, 0x01, 0xfb, 0x00]
        );
    }

    #[test]
    fn test_time_sync_packet_half_hour_zone_without_dst() {
        let time = ZonedTime {
            local: NaiveDate::from_ymd_opt(2025, 1, 31)
                .unwrap()
                .and_hms_opt(23, 0, 0)
                .unwrap(),
            zone: ZoneInfo {
                utc_offset_minutes: 330,
                dst_offset_minutes: 0,
            },
        };

        assert_eq!(
            encode_time_sync_packet(&time),
            vec![0x0c, 0x00, 0x00, 0x07, 0xe9, 0x01, 0x1f, 0x17, 0x00, 0x00, 0x00, 0x05, 0x1e]
        );
    }

    #[test]
    fn test_timezone_dst_flag_short_input_is_unsupported() {
        assert!(!has_timezone_dst_flag(&[]));
        assert!(!has_timezone_dst_flag(&[0xff; 4]));
    }

    #[test]
    fn test_timezone_dst_flag_reads_bit_one_of_byte_four() {
        for len in 5..8 {
            for byte in 0..=u8::MAX {
                let mut value = vec![0xffu8; len];
                value[4] = byte;
                assert_eq!(has_timezone_dst_flag(&value), byte & 0x02 != 0);
            }
        }
    }

    #[test]
    fn test_local_zone_dst_is_never_negative() {
        let zone = ZoneInfo::local();
        assert!(zone.dst_offset_minutes >= 0);
    }
}
