//! Pure parsers for platform tool output.
//!
//! Every function here is total: junk rows are skipped, never errors,
//! so a parser applied twice to the same text yields the same result.
//! Structured JSON (lsblk, PowerShell) is the preferred source; the
//! fixed-column text tools (`fdisk`, `diskutil`) get hand parsers with
//! fixture tests below.

use crate::error::{HalError, HalResult};
use crate::types::{Drive, Mountpoint, Partition};
use serde_json::Value;

/// Parse `lsblk --json --bytes --output-all` (or a column subset)
/// into whole-disk entries. Partition children contribute their
/// mountpoints to the parent disk.
pub fn parse_lsblk_json(json: &str) -> HalResult<Vec<Drive>> {
    let root: Value = serde_json::from_str(json)
        .map_err(|e| HalError::Parse(format!("lsblk json: {e}")))?;
    let devices = root
        .get("blockdevices")
        .and_then(Value::as_array)
        .ok_or_else(|| HalError::Parse("lsblk json: missing blockdevices".into()))?;

    let mut drives = Vec::new();
    for dev in devices {
        if dev.get("type").and_then(Value::as_str) != Some("disk") {
            continue;
        }
        let name = match dev.get("name").and_then(Value::as_str) {
            Some(n) => n,
            None => continue,
        };
        let device_path = dev
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("/dev/{name}"));

        let mut mounts = Vec::new();
        collect_mountpoints(dev, &mut mounts);
        let is_system = mounts
            .iter()
            .any(|m| m == "/" || m.starts_with("/boot"));

        drives.push(Drive {
            device_path,
            description: join_description(
                dev.get("vendor").and_then(Value::as_str),
                dev.get("model").and_then(Value::as_str),
            ),
            bus_type: bus_type_label(dev.get("tran").and_then(Value::as_str)),
            is_removable: json_flag(dev.get("rm")),
            is_system,
            is_readonly: json_flag(dev.get("ro")),
            mountpoints: mounts.into_iter().map(Mountpoint::new).collect(),
        });
    }
    Ok(drives)
}

/// lsblk emits `rm`/`ro` as booleans on current releases and as the
/// strings `"0"`/`"1"` on older ones.
fn json_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "yes"),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn bus_type_label(tran: Option<&str>) -> String {
    match tran.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_uppercase(),
        _ => "UNKNOWN".to_string(),
    }
}

fn join_description(vendor: Option<&str>, model: Option<&str>) -> String {
    let mut parts = Vec::new();
    for piece in [vendor, model].into_iter().flatten() {
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    parts.join(" ")
}

fn collect_mountpoints(node: &Value, out: &mut Vec<String>) {
    // Newer lsblk: "mountpoints": ["/mnt/a", null]; older: "mountpoint".
    if let Some(list) = node.get("mountpoints").and_then(Value::as_array) {
        for entry in list {
            if let Some(path) = entry.as_str() {
                out.push(path.to_string());
            }
        }
    } else if let Some(path) = node.get("mountpoint").and_then(Value::as_str) {
        out.push(path.to_string());
    }
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            collect_mountpoints(child, out);
        }
    }
}

/// Parse the partition table section of `fdisk -l <device>` output.
///
/// The table starts at the row whose first token is literally `Device`.
/// A `*` in the second column marks the boot partition and shifts every
/// remaining column right by one. Rows too short to carry the full
/// column set are skipped.
pub fn parse_fdisk_listing(output: &str) -> Vec<Partition> {
    let mut rows = Vec::new();
    let mut in_table = false;
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !in_table {
            in_table = tokens.first() == Some(&"Device");
            continue;
        }
        if tokens.is_empty() {
            continue;
        }
        let boot = tokens.get(1) == Some(&"*");
        let offset = usize::from(boot);
        if tokens.len() < 7 + offset {
            continue;
        }
        rows.push(Partition {
            device: tokens[0].to_string(),
            boot,
            start: tokens[1 + offset].parse().ok(),
            end: tokens[2 + offset].parse().ok(),
            sectors: tokens[3 + offset].parse().ok(),
            size: tokens[4 + offset].to_string(),
            id: Some(tokens[5 + offset].to_string()),
            type_name: tokens[6 + offset..].join(" "),
            name: None,
        });
    }
    rows
}

/// Parse `diskutil list <device>` output.
///
/// The first three lines are fixed preamble: the device title, the
/// column header, and the whole-disk summary row. Data rows tokenize to
/// 6 fields (one-word volume name) or 7 (two-word name); anything else
/// is skipped, as are free-space rows whose identifier is `-`.
pub fn parse_diskutil_listing(output: &str) -> Vec<Partition> {
    let mut rows = Vec::new();
    for line in output.lines().skip(3) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (type_name, name, size, unit, identifier) = match tokens.len() {
            6 => (tokens[1], tokens[2].to_string(), tokens[3], tokens[4], tokens[5]),
            7 => (
                tokens[1],
                format!("{} {}", tokens[2], tokens[3]),
                tokens[4],
                tokens[5],
                tokens[6],
            ),
            _ => continue,
        };
        if identifier == "-" {
            continue;
        }
        rows.push(Partition {
            device: format!("/dev/{identifier}"),
            boot: false,
            start: None,
            end: None,
            sectors: None,
            size: format!("{size} {unit}"),
            id: None,
            type_name: type_name.to_string(),
            name: Some(name),
        });
    }
    rows
}

/// `diskutil list` whole-disk title lines, e.g.
/// `/dev/disk4 (external, physical):` -> `("/dev/disk4", "external, physical")`.
pub fn parse_diskutil_disks(output: &str) -> Vec<(String, String)> {
    let mut disks = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("/dev/disk") {
            continue;
        }
        let Some((device, rest)) = line.split_once(' ') else {
            continue;
        };
        let qualifiers = rest
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(':')
            .trim_end_matches(')')
            .to_string();
        disks.push((device.to_string(), qualifiers));
    }
    disks
}

/// `diskutil info <device>` key/value lines, split at the first colon.
pub fn parse_diskutil_info(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn diskutil_info_value<'a>(info: &'a [(String, String)], key: &str) -> Option<&'a str> {
    info.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// BSD `mount` table lines: `/dev/disk4s1 on /Volumes/FOO (apfs, ...)`.
pub fn parse_mount_table(output: &str) -> Vec<(String, String)> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let Some((device, rest)) = line.split_once(" on ") else {
            continue;
        };
        let mountpoint = match rest.rfind(" (") {
            Some(idx) => &rest[..idx],
            None => rest,
        };
        let mountpoint = mountpoint.trim();
        if device.is_empty() || mountpoint.is_empty() {
            continue;
        }
        rows.push((device.trim().to_string(), mountpoint.to_string()));
    }
    rows
}

/// First attached device node in `hdiutil attach` output.
pub fn parse_hdiutil_attach(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|token| token.starts_with("/dev/disk"))
        .map(str::to_string)
}

/// First numeric token of `du -s` style output.
pub fn parse_du_size(output: &str) -> Option<u64> {
    output
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
}

/// `ConvertTo-Json` collapses a single-element pipeline to a bare
/// object; normalize to a list either way.
fn powershell_items(json: &str) -> HalResult<Vec<Value>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| HalError::Parse(format!("powershell json: {e}")))?;
    Ok(match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn ps_str(item: &Value, key: &str) -> String {
    match item.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn ps_u64(item: &Value, key: &str) -> Option<u64> {
    item.get(key).and_then(Value::as_u64)
}

fn ps_bool(item: &Value, key: &str) -> bool {
    item.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Storage bus numbers as serialized by older PowerShell hosts that
/// render the enum numerically.
fn win_bus_label(raw: &str) -> String {
    match raw {
        "7" => "USB".to_string(),
        "11" => "SATA".to_string(),
        "12" => "SD".to_string(),
        "13" => "MMC".to_string(),
        "17" => "NVME".to_string(),
        "" | "0" => "UNKNOWN".to_string(),
        other => other.to_uppercase(),
    }
}

/// `Get-Disk | ... | ConvertTo-Json` into drives. Mountpoints come from
/// the per-disk partition query and are attached by the caller.
pub fn parse_win_disks(json: &str) -> HalResult<Vec<Drive>> {
    let mut drives = Vec::new();
    for item in powershell_items(json)? {
        let number = match ps_u64(&item, "Number") {
            Some(n) => n,
            None => continue,
        };
        let bus = win_bus_label(&ps_str(&item, "BusType"));
        drives.push(Drive {
            device_path: format!(r"\\.\PhysicalDrive{number}"),
            description: ps_str(&item, "FriendlyName"),
            is_removable: matches!(bus.as_str(), "USB" | "SD" | "MMC"),
            bus_type: bus,
            is_system: ps_bool(&item, "IsBoot") || ps_bool(&item, "IsSystem"),
            is_readonly: ps_bool(&item, "IsReadOnly"),
            mountpoints: Vec::new(),
        });
    }
    Ok(drives)
}

/// `Get-Partition -DiskNumber N | ... | ConvertTo-Json` into partitions.
pub fn parse_win_partitions(disk_number: u64, json: &str) -> HalResult<Vec<Partition>> {
    let mut rows = Vec::new();
    for item in powershell_items(json)? {
        let number = match ps_u64(&item, "PartitionNumber") {
            Some(n) => n,
            None => continue,
        };
        let letter = win_drive_letter(item.get("DriveLetter"));
        let device = match &letter {
            Some(l) => format!("{l}:"),
            None => format!("disk{disk_number}part{number}"),
        };
        rows.push(Partition {
            device,
            boot: ps_bool(&item, "IsBoot"),
            start: None,
            end: None,
            sectors: None,
            size: ps_u64(&item, "Size").map(|s| s.to_string()).unwrap_or_default(),
            id: None,
            type_name: ps_str(&item, "Type"),
            name: letter.map(|l| format!("{l}:\\")),
        });
    }
    Ok(rows)
}

/// DriveLetter is a `char`: an assigned letter serializes as a one-char
/// string or its code point; unassigned is null or NUL.
fn win_drive_letter(value: Option<&Value>) -> Option<char> {
    match value {
        Some(Value::String(s)) => s.trim().chars().next().filter(|c| c.is_ascii_alphabetic()),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|code| char::from_u32(code as u32))
            .filter(|c| c.is_ascii_alphabetic()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FDISK_FIXTURE: &str = "\
Disk /dev/sdb: 28.91 GiB, 31042043904 bytes, 60629008 sectors
Disk model: USB DISK 3.0
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
Disklabel type: dos
Disk identifier: 0x6d1d1feb

Device     Boot   Start      End  Sectors  Size Id Type
/dev/sdb1  *         64  5267455  5267392  2.5G 17 Hidden HPFS/NTFS
/dev/sdb2       5267456  5287935    20480   10M  1 FAT12
/dev/sdb3       5287936 60628991 55341056 26.4G 83 Linux
";

    #[test]
    fn fdisk_boot_star_shifts_columns() {
        let rows = parse_fdisk_listing(FDISK_FIXTURE);
        assert_eq!(rows.len(), 3);

        let boot = &rows[0];
        assert_eq!(boot.device, "/dev/sdb1");
        assert!(boot.boot);
        assert_eq!(boot.start, Some(64));
        assert_eq!(boot.end, Some(5_267_455));
        assert_eq!(boot.sectors, Some(5_267_392));
        assert_eq!(boot.size, "2.5G");
        assert_eq!(boot.id.as_deref(), Some("17"));
        assert_eq!(boot.type_name, "Hidden HPFS/NTFS");

        let plain = &rows[1];
        assert!(!plain.boot);
        assert_eq!(plain.start, Some(5_267_456));
        assert_eq!(plain.type_name, "FAT12");
    }

    #[test]
    fn fdisk_same_fields_with_and_without_boot_flag() {
        let rows = parse_fdisk_listing(FDISK_FIXTURE);
        for row in &rows {
            assert!(row.start.is_some());
            assert!(row.end.is_some());
            assert!(row.sectors.is_some());
            assert!(row.id.is_some());
            assert!(!row.type_name.is_empty());
        }
    }

    #[test]
    fn fdisk_ignores_preamble_and_junk() {
        assert!(parse_fdisk_listing("no table here at all\n").is_empty());
        let with_junk = format!("{FDISK_FIXTURE}\nshort row\n");
        assert_eq!(parse_fdisk_listing(&with_junk).len(), 3);
    }

    const DISKUTIL_FIXTURE: &str = "\
/dev/disk4 (external, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:     FDisk_partition_scheme                        *31.9 GB    disk4
   1:             Windows_NTFS UNTITLED                30.9 GB    disk4s1
   2:                 Apple_HFS Install Media           1.0 GB     disk4s2
                    (free space)                         21.5 KB    -
";

    #[test]
    fn diskutil_keeps_only_named_rows() {
        let rows = parse_diskutil_listing(DISKUTIL_FIXTURE);
        // Header and summary fall inside the skipped preamble; the
        // free-space row fails both the token rule and the '-' guard.
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].device, "/dev/disk4s1");
        assert_eq!(rows[0].type_name, "Windows_NTFS");
        assert_eq!(rows[0].name.as_deref(), Some("UNTITLED"));
        assert_eq!(rows[0].size, "30.9 GB");

        assert_eq!(rows[1].device, "/dev/disk4s2");
        assert_eq!(rows[1].name.as_deref(), Some("Install Media"));
        assert_eq!(rows[1].size, "1.0 GB");
    }

    #[test]
    fn diskutil_row_count_follows_token_rule() {
        let rows = parse_diskutil_listing(DISKUTIL_FIXTURE);
        let candidate_lines = DISKUTIL_FIXTURE
            .lines()
            .skip(3)
            .filter(|l| matches!(l.split_whitespace().count(), 6 | 7))
            .filter(|l| l.split_whitespace().last() != Some("-"))
            .count();
        assert_eq!(rows.len(), candidate_lines);
    }

    #[test]
    fn diskutil_disks_parses_title_lines() {
        let disks = parse_diskutil_disks(DISKUTIL_FIXTURE);
        assert_eq!(
            disks,
            vec![("/dev/disk4".to_string(), "external, physical".to_string())]
        );
    }

    const LSBLK_FIXTURE: &str = r#"{
  "blockdevices": [
    {
      "name": "nvme0n1", "path": "/dev/nvme0n1", "type": "disk",
      "rm": false, "ro": false, "tran": "nvme",
      "vendor": null, "model": "Samsung SSD 980",
      "children": [
        {"name": "nvme0n1p1", "type": "part", "mountpoints": ["/boot/efi"]},
        {"name": "nvme0n1p2", "type": "part", "mountpoints": ["/"]}
      ]
    },
    {
      "name": "sdb", "path": "/dev/sdb", "type": "disk",
      "rm": "1", "ro": "0", "tran": "usb",
      "vendor": "SanDisk ", "model": "Ultra Fit",
      "children": [
        {"name": "sdb1", "type": "part", "mountpoint": "/media/user/STICK"}
      ]
    },
    {
      "name": "loop0", "type": "loop", "mountpoints": ["/snap/core"]
    }
  ]
}"#;

    #[test]
    fn lsblk_parses_disks_with_string_and_bool_flags() {
        let drives = parse_lsblk_json(LSBLK_FIXTURE).unwrap();
        assert_eq!(drives.len(), 2);

        let system = &drives[0];
        assert_eq!(system.device_path, "/dev/nvme0n1");
        assert_eq!(system.bus_type, "NVME");
        assert!(system.is_system);
        assert!(!system.is_removable);
        assert_eq!(system.description, "Samsung SSD 980");

        let stick = &drives[1];
        assert_eq!(stick.device_path, "/dev/sdb");
        assert_eq!(stick.bus_type, "USB");
        assert!(stick.is_removable);
        assert!(!stick.is_system);
        assert!(!stick.is_readonly);
        assert_eq!(stick.description, "SanDisk Ultra Fit");
        assert_eq!(stick.mountpoints.len(), 1);
        assert_eq!(stick.mountpoints[0].path, "/media/user/STICK");
    }

    #[test]
    fn lsblk_missing_tran_is_unknown_bus() {
        let json = r#"{"blockdevices": [{"name": "sdc", "type": "disk"}]}"#;
        let drives = parse_lsblk_json(json).unwrap();
        assert_eq!(drives[0].bus_type, "UNKNOWN");
        assert_eq!(drives[0].device_path, "/dev/sdc");
    }

    #[test]
    fn win_disks_accepts_object_or_array() {
        let single = r#"{"Number": 1, "FriendlyName": "Kingston DataTraveler",
            "BusType": "USB", "IsBoot": false, "IsSystem": false,
            "IsReadOnly": false, "Size": 31042043904}"#;
        let drives = parse_win_disks(single).unwrap();
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].device_path, r"\\.\PhysicalDrive1");
        assert!(drives[0].is_removable);

        let many = format!("[{single}, {{\"Number\": 0, \"BusType\": 11, \"IsBoot\": true}}]");
        let drives = parse_win_disks(&many).unwrap();
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[1].bus_type, "SATA");
        assert!(drives[1].is_system);
        assert!(!drives[1].is_removable);
    }

    #[test]
    fn win_partitions_handles_letter_shapes() {
        let json = r#"[
            {"PartitionNumber": 1, "DriveLetter": "E", "Size": 1048576, "Type": "Basic", "IsBoot": false},
            {"PartitionNumber": 2, "DriveLetter": 70, "Size": 2048, "Type": "IFS", "IsBoot": true},
            {"PartitionNumber": 3, "DriveLetter": 0, "Size": 4096, "Type": "Reserved", "IsBoot": false}
        ]"#;
        let rows = parse_win_partitions(2, json).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].device, "E:");
        assert_eq!(rows[1].device, "F:");
        assert!(rows[1].boot);
        assert_eq!(rows[2].device, "disk2part3");
        assert_eq!(rows[2].name, None);
    }

    #[test]
    fn hdiutil_attach_reports_first_disk_node() {
        let output = "\
/dev/disk5          \tGUID_partition_scheme          \t
/dev/disk5s1        \tEFI                            \t
/dev/disk5s2        \tApple_HFS                      \t/Volumes/Install
";
        assert_eq!(parse_hdiutil_attach(output).as_deref(), Some("/dev/disk5"));
        assert_eq!(parse_hdiutil_attach("nothing attached"), None);
    }

    #[test]
    fn du_takes_leading_number() {
        assert_eq!(parse_du_size("4451942400\t/tmp/iso-contents/j1\n"), Some(4_451_942_400));
        assert_eq!(parse_du_size("du: cannot access"), None);
    }

    #[test]
    fn mount_table_splits_device_and_path() {
        let output = "\
/dev/disk3s1 on / (apfs, sealed, local, read-only, journaled)
/dev/disk4s1 on /Volumes/My Stick (msdos, local, nodev)
devfs on /dev (devfs, local, nobrowse)
";
        let rows = parse_mount_table(output);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].0, "/dev/disk4s1");
        assert_eq!(rows[1].1, "/Volumes/My Stick");
    }

    #[test]
    fn diskutil_info_key_values() {
        let output = "\
   Device Identifier:         disk4
   Device Node:               /dev/disk4
   Protocol:                  USB
   Removable Media:           Removable
   Read-Only Media:           No
";
        let info = parse_diskutil_info(output);
        assert_eq!(diskutil_info_value(&info, "Protocol"), Some("USB"));
        assert_eq!(diskutil_info_value(&info, "Removable Media"), Some("Removable"));
        assert_eq!(diskutil_info_value(&info, "Missing"), None);
    }
}
