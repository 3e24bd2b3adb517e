//! Summaries of `dumpsys alarm` and `dumpsys notification`.

use clap::ValueEnum;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::{
    device::Device,
    error::{CliError, Result},
    output::{print_error, print_message},
};

/// Pending alarms and alarm history are only listed from API 29 on.
const MIN_API_FOR_ALARM_DETAILS: u32 = 29;

lazy_static! {
    static ref SPACES: Regex = Regex::new(r" +").unwrap();
    static ref BATCH_INFO: Regex = Regex::new(r"Batch\{(.*?)\}:").unwrap();
    static ref BRACES: Regex = Regex::new(r"\{(.*?)\}").unwrap();
    static ref NOTIFICATION_PACKAGE: Regex = Regex::new(r"pkg=(\S*)").unwrap();
    static ref NOTIFICATION_TITLE: Regex = Regex::new(r"android\.title=(.*)").unwrap();
    static ref NOTIFICATION_TEXT: Regex = Regex::new(r"android\.text=(.*)").unwrap();
    static ref QUOTED: Regex = Regex::new(r#"".*?""#).unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AlarmKind {
    All,
    Top,
    Pending,
    History,
}

/// The lines between the first `start` marker and the first of the `ends` after it, with runs
/// of spaces collapsed and indentation removed.
fn section(dump: &str, start: &str, ends: &[&str]) -> Vec<String> {
    let Some((_, rest)) = dump.split_once(start) else {
        return Vec::new();
    };
    let end = ends
        .iter()
        .filter_map(|end| rest.find(end))
        .min()
        .unwrap_or(rest.len());
    rest[..end]
        .lines()
        .map(|line| SPACES.replace_all(line, " ").trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopAlarm {
    pub package: String,
    pub action: String,
    pub running_time: String,
    pub wakeups: String,
    pub alarms: String,
    pub uid: String,
}

/// Entries come in pairs of lines:
/// `+2m19s468ms running, 0 wakeups, 708 alarms: 1000:android`
/// `*alarm*:com.android.server.action.NETWORK_STATS_POLL`
pub fn parse_top_alarms(dump: &str) -> Vec<TopAlarm> {
    let lines = section(dump, "Top Alarms:", &["Alarm Stats:"]);
    let mut alarms = Vec::new();
    for (key, value) in lines.iter().zip(lines.iter().skip(1)) {
        if !key.starts_with('+') {
            continue;
        }
        let fields: Vec<&str> = key.split(',').map(str::trim).collect();
        let &[running, wakeups, counts] = fields.as_slice() else {
            debug!("Unexpected top alarm line: {key}");
            continue;
        };
        let first_word = |s: &str| s.split(' ').next().unwrap_or_default().to_owned();
        let owner: Vec<&str> = counts.split(':').map(str::trim).collect();
        alarms.push(TopAlarm {
            package: owner.get(2).copied().unwrap_or_default().to_owned(),
            action: value
                .split_once(':')
                .map(|(_, action)| action.to_owned())
                .unwrap_or_default(),
            running_time: first_word(running),
            wakeups: first_word(wakeups),
            alarms: first_word(counts),
            uid: owner.get(1).copied().unwrap_or_default().to_owned(),
        });
    }
    alarms
}

fn describe_top_alarms(alarms: &[TopAlarm], padding: &str) -> String {
    let mut out = String::from("Top Alarms:\n");
    for alarm in alarms {
        out += &format!(
            "{padding}Package name: {}\n\
             {padding}{padding}Action: {}\n\
             {padding}{padding}Running time: {}\n\
             {padding}{padding}Number of device woke up: {}\n\
             {padding}{padding}Number of alarms: {}\n\
             {padding}{padding}User ID: {}\n",
            alarm.package, alarm.action, alarm.running_time, alarm.wakeups, alarm.alarms, alarm.uid
        );
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAlarm {
    pub number: String,
    pub package: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmBatch {
    pub id: String,
    pub alarm_count: String,
    pub alarms: Vec<PendingAlarm>,
}

fn field_value(field: Option<&&str>) -> String {
    field
        .and_then(|f| f.split_once('='))
        .map(|(_, value)| value.to_owned())
        .unwrap_or_default()
}

/// `Batch{a1b2c3 num=2 start=123 end=456 flgs=0x1}:` lines, each followed by its alarms, e.g.
/// `RTC_WAKEUP #0: Alarm{d4e5f6 type 0 when 1700000000000 com.example.app}`.
pub fn parse_pending_alarms(dump: &str) -> Vec<AlarmBatch> {
    let lines = section(
        dump,
        "Pending alarm batches:",
        &[
            "Pending user blocked background alarms",
            "Past-due non-wakeup alarms",
        ],
    );
    let mut batches: Vec<AlarmBatch> = Vec::new();
    for line in &lines {
        if line.starts_with("Batch") {
            let Some(cap) = BATCH_INFO.captures(line) else {
                continue;
            };
            let info: Vec<&str> = cap[1].split(' ').collect();
            debug!(
                "Batch {} start: {}, end: {}",
                info.first().copied().unwrap_or_default(),
                field_value(info.get(2)),
                field_value(info.get(3))
            );
            batches.push(AlarmBatch {
                id: info.first().copied().unwrap_or_default().to_owned(),
                alarm_count: field_value(info.get(1)),
                alarms: Vec::new(),
            });
        } else if ["RTC", "ELAPSED"].iter().any(|kind| line.starts_with(kind)) {
            let (Some(batch), Some(cap)) = (batches.last_mut(), BRACES.captures(line)) else {
                continue;
            };
            let info: Vec<&str> = cap[1].split(' ').collect();
            let number = line
                .split_once('#')
                .and_then(|(_, rest)| rest.split(':').next())
                .unwrap_or_default();
            batch.alarms.push(PendingAlarm {
                number: number.to_owned(),
                package: info.get(5).copied().unwrap_or_default().to_owned(),
            });
        }
    }
    batches
}

fn describe_pending_alarms(batches: &[AlarmBatch], padding: &str) -> String {
    let mut out = String::from("Pending Alarms:\n");
    for batch in batches {
        out += &format!(
            "{padding}ID: {}\n{padding}{padding}Number of alarms: {}\n",
            batch.id, batch.alarm_count
        );
        for alarm in &batch.alarms {
            out += &format!(
                "{padding}{padding}Alarm #{}:\n{padding}{padding}Package: {}\n",
                alarm.number, alarm.package
            );
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmHistory {
    pub package: String,
    pub user_id: String,
    /// Missing for new alarms.
    pub history: Option<String>,
}

/// `com.example.app, u0a153: +5m12s, +1h2m` lines
pub fn parse_alarm_history(dump: &str) -> Vec<AlarmHistory> {
    section(dump, "App Alarm history:", &["Past-due non-wakeup alarms"])
        .iter()
        .filter_map(|line| {
            let (package, rest) = line.split_once(',')?;
            let mut fields = rest.splitn(2, ':');
            Some(AlarmHistory {
                package: package.trim().to_owned(),
                user_id: fields.next().unwrap_or_default().trim().to_owned(),
                history: fields.next().map(|h| h.trim().to_owned()),
            })
        })
        .collect()
}

fn describe_alarm_history(entries: &[AlarmHistory], padding: &str) -> String {
    let mut out = String::from("App Alarm history\n");
    for entry in entries {
        out += &format!(
            "{padding}Package name: {}\n{padding}{padding}User ID: {}\n",
            entry.package, entry.user_id
        );
        if let Some(history) = &entry.history {
            out += &format!("{padding}{padding}history: {history}\n");
        }
    }
    out
}

pub async fn alarms(device: &Device, kind: AlarmKind) -> Result<()> {
    let api_version = device.api_version().await?;
    let output = device.shell("dumpsys alarm").await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Something gone wrong on dumping alarms. Error: {}",
            output.stderr.trim()
        )));
    }
    let dump = output.text();
    let padding = if kind == AlarmKind::All { "\t" } else { "" };
    let details_supported = api_version >= MIN_API_FOR_ALARM_DETAILS;
    let unsupported =
        "Your Android version (API 28 and below) does not support listing pending alarm";

    if matches!(kind, AlarmKind::All | AlarmKind::Top) {
        print_message(describe_top_alarms(&parse_top_alarms(dump), padding).trim_end());
    }
    if matches!(kind, AlarmKind::All | AlarmKind::Pending) {
        if details_supported {
            print_message(describe_pending_alarms(&parse_pending_alarms(dump), padding).trim_end());
        } else {
            print_error(unsupported);
        }
    }
    if matches!(kind, AlarmKind::All | AlarmKind::History) {
        if details_supported {
            print_message(describe_alarm_history(&parse_alarm_history(dump), padding).trim_end());
        } else {
            print_error(unsupported);
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notification {
    pub package: String,
    pub title: Option<String>,
    pub text: Option<String>,
    pub actions: Vec<String>,
}

fn first_capture(lines: &[&str], regex: &Regex) -> Option<String> {
    lines
        .iter()
        .find_map(|line| regex.captures(line).map(|cap| cap[1].to_owned()))
}

pub fn parse_notifications(dump: &str) -> Vec<Notification> {
    let lines: Vec<&str> = dump.lines().map(str::trim).collect();
    let starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("NotificationRecord("))
        .map(|(i, _)| i)
        .collect();

    let mut notifications = Vec::new();
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(lines.len());
        let record = lines[start];
        let body = &lines[start + 1..end];

        let mut actions = Vec::new();
        if let Some(open) = body.iter().position(|line| line.starts_with("actions={")) {
            for line in body[open + 1..].iter().take_while(|line| **line != "}") {
                actions.extend(QUOTED.find_iter(line).map(|m| m.as_str().to_owned()));
            }
        }

        notifications.push(Notification {
            package: NOTIFICATION_PACKAGE
                .captures(record)
                .map(|cap| cap[1].to_owned())
                .unwrap_or_default(),
            title: first_capture(body, &NOTIFICATION_TITLE),
            text: first_capture(body, &NOTIFICATION_TEXT).filter(|text| text != "null"),
            actions,
        });
    }
    notifications
}

pub async fn notifications(device: &Device) -> Result<()> {
    // --noredact is needed from Android 6.0 on to see titles and texts.
    let output = device.shell("dumpsys notification --noredact").await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Something gone wrong on fetching notification info. Error: {}",
            output.stderr.trim()
        )));
    }
    for notification in parse_notifications(output.text()) {
        print_message(&format!("Package: {}", notification.package));
        if let Some(title) = &notification.title {
            print_message(&format!("Title: {title}"));
        }
        if let Some(text) = &notification.text {
            print_message(&format!("Text: {text}"));
        }
        for action in &notification.actions {
            print_message(&format!("Action: {action}"));
        }
        print_message("");
    }
    Ok(())
}
