use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu_percent: Option<f64>,
    pub memory_used_gb: Option<f64>,
    pub memory_total_gb: Option<f64>,
    pub memory_percent: Option<f64>,
    pub load_average_1m: Option<f64>,
    pub load_average_5m: Option<f64>,
    pub load_average_15m: Option<f64>,
    pub load_max: Option<f64>,
    pub load_ratio: Option<f64>,
    pub disks: Vec<DiskUsage>,
    pub users: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskUsage {
    pub path: String,
    pub label: Option<String>,
    pub total_gb: Option<f64>,
    pub used_gb: Option<f64>,
    pub free_gb: Option<f64>,
    pub percent_used: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GpuEntry {
    Ok(GpuStats),
    Err { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuStats {
    #[serde(rename = "id")]
    pub index: Option<u32>,
    pub name: Option<String>,
    pub uuid: Option<String>,
    #[serde(rename = "utilization_gpu_percent")]
    pub utilization_percent: Option<f64>,
    pub memory_used_mib: Option<f64>,
    pub memory_total_mib: Option<f64>,
    pub memory_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub fan_speed_percent: Option<f64>,
    #[serde(rename = "power_usage_watts")]
    pub power_draw_watts: Option<f64>,
    pub power_limit_watts: Option<f64>,
    pub processes: Vec<ProcessEntry>,
    pub process_usernames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessEntry {
    Ok(ProcessStats),
    Err { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    pub pid: Option<u32>,
    pub username: Option<String>,
    pub command: Option<String>,
    pub gpu_memory_used_mib: Option<f64>,
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExporterReport {
    pub hostname: Option<String>,
    pub timestamp_utc: Option<String>,
    pub system: SystemStats,
    pub gpus: Vec<GpuEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    NotAnObject,
    Exporter(String),
}

impl ExporterReport {
    pub fn from_value(value: &Value) -> Result<Self, ReportError> {
        let obj = value.as_object().ok_or(ReportError::NotAnObject)?;

        if let Some(err) = obj.get("error").filter(|v| !v.is_null()) {
            return Err(ReportError::Exporter(describe(err)));
        }

        let system = obj
            .get("system")
            .and_then(Value::as_object)
            .map(parse_system)
            .unwrap_or_default();

        let gpus = obj
            .get("gpus")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_gpu).collect())
            .unwrap_or_default();

        Ok(Self {
            hostname: text(obj, "hostname"),
            timestamp_utc: text(obj, "timestamp_utc"),
            system,
            gpus,
        })
    }
}

fn parse_system(obj: &Map<String, Value>) -> SystemStats {
    let memory_used_gb = number(obj, "memory_used_gb");
    let memory_total_gb = number(obj, "memory_total_gb");
    let load_average_1m = number(obj, "load_average_1m");
    let load_max = number(obj, "load_max");

    SystemStats {
        cpu_percent: number(obj, "cpu_percent").map(|v| v.clamp(0.0, 100.0)),
        memory_used_gb,
        memory_total_gb,
        memory_percent: number(obj, "memory_percent")
            .or_else(|| percent(memory_used_gb, memory_total_gb)),
        load_average_1m,
        load_average_5m: number(obj, "load_average_5m"),
        load_average_15m: number(obj, "load_average_15m"),
        load_max,
        load_ratio: match (load_average_1m, load_max) {
            (Some(load), Some(max)) if max > 0.0 => Some(load / max),
            _ => None,
        },
        disks: obj
            .get("disks")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_disk).collect())
            .unwrap_or_default(),
        users: obj
            .get("users")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|u| match u {
                        Value::String(name) => Some(name.clone()),
                        Value::Object(o) => text(o, "name"),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        error: obj.get("error").filter(|v| !v.is_null()).map(describe),
    }
}

fn parse_disk(value: &Value) -> Option<DiskUsage> {
    let obj = value.as_object()?;
    let total_gb = number(obj, "total_gb");
    let used_gb = number(obj, "used_gb");
    Some(DiskUsage {
        path: text(obj, "path").unwrap_or_default(),
        label: text(obj, "label"),
        total_gb,
        used_gb,
        free_gb: number(obj, "free_gb"),
        percent_used: number(obj, "percent_used").or_else(|| percent(used_gb, total_gb)),
        error: obj.get("error").filter(|v| !v.is_null()).map(describe),
    })
}

fn parse_gpu(value: &Value) -> GpuEntry {
    let Some(obj) = value.as_object() else {
        return GpuEntry::Err {
            error: "некорректная запись GPU".to_string(),
        };
    };
    if let Some(err) = obj.get("error").filter(|v| !v.is_null()) {
        return GpuEntry::Err {
            error: describe(err),
        };
    }
    // "No NVIDIA GPUs found" and similar notices carry only a message.
    if let (Some(message), false) = (text(obj, "message"), obj.contains_key("name")) {
        return GpuEntry::Err { error: message };
    }

    let memory_used_mib = number(obj, "memory_used_mib");
    let memory_total_mib = number(obj, "memory_total_mib");
    let processes: Vec<ProcessEntry> = obj
        .get("processes")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse_process).collect())
        .unwrap_or_default();

    let mut process_usernames: Vec<String> = processes
        .iter()
        .filter_map(|p| match p {
            ProcessEntry::Ok(stats) => stats.username.clone(),
            ProcessEntry::Err { .. } => None,
        })
        .collect();
    process_usernames.sort();
    process_usernames.dedup();

    GpuEntry::Ok(GpuStats {
        index: integer(obj, "id").or_else(|| integer(obj, "index")),
        name: text(obj, "name"),
        uuid: text(obj, "uuid"),
        utilization_percent: number(obj, "utilization_gpu_percent"),
        memory_used_mib,
        memory_total_mib,
        memory_percent: number(obj, "memory_percent")
            .or_else(|| percent(memory_used_mib, memory_total_mib)),
        temperature_celsius: number(obj, "temperature_celsius"),
        fan_speed_percent: number(obj, "fan_speed_percent"),
        power_draw_watts: number(obj, "power_usage_watts"),
        power_limit_watts: number(obj, "power_limit_watts"),
        processes,
        process_usernames,
    })
}

fn parse_process(value: &Value) -> ProcessEntry {
    let Some(obj) = value.as_object() else {
        return ProcessEntry::Err {
            error: "некорректная запись процесса".to_string(),
        };
    };
    if let Some(err) = obj.get("error").filter(|v| !v.is_null()) {
        return ProcessEntry::Err {
            error: describe(err),
        };
    }
    ProcessEntry::Ok(ProcessStats {
        pid: integer(obj, "pid"),
        username: text(obj, "username"),
        command: text(obj, "command"),
        gpu_memory_used_mib: number(obj, "gpu_memory_used_mib"),
        cpu_percent: number(obj, "cpu_percent"),
    })
}

fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

fn integer(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    obj.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn percent(used: Option<f64>, total: Option<f64>) -> Option<f64> {
    match (used, total) {
        (Some(used), Some(total)) if total > 0.0 => Some((used / total) * 100.0),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "hostname": "mock-host",
            "timestamp_utc": "2024-04-01T00:00:00Z",
            "system": {
                "cpu_percent": 37.5,
                "memory_total_gb": 64.0,
                "memory_used_gb": 21.5,
                "memory_percent": 33.6,
                "load_average_1m": 8.0,
                "load_average_5m": 0.95,
                "load_average_15m": 0.81,
                "load_max": 32,
                "disks": [
                    {"path": "/", "label": "Root (/)", "total_gb": 100.0, "used_gb": 55.0,
                     "free_gb": 45.0, "percent_used": 55.0},
                    {"path": "/data-local/job", "label": "Data", "error": "Permission denied"}
                ]
            },
            "gpus": [{
                "id": 0,
                "name": "Mock GPU",
                "uuid": "GPU-1234",
                "utilization_gpu_percent": 75,
                "memory_total_mib": 16384,
                "memory_used_mib": 8192,
                "temperature_celsius": 55,
                "power_usage_watts": 120.0,
                "power_limit_watts": 200.0,
                "fan_speed_percent": "N/A",
                "processes": [
                    {"pid": 1001, "username": "bob", "command": "python train.py",
                     "gpu_memory_used_mib": 4096, "cpu_percent": 12.5},
                    {"pid": 1002, "username": "alice", "command": "python eval.py",
                     "gpu_memory_used_mib": 1024, "cpu_percent": 0.0},
                    {"pid": 1003, "username": "bob", "command": "python train.py",
                     "gpu_memory_used_mib": 10, "cpu_percent": 1.0},
                    {"error": "Could not retrieve processes: boom"}
                ]
            }]
        })
    }

    #[test]
    fn parses_full_payload() {
        let report = ExporterReport::from_value(&sample_payload()).unwrap();
        assert_eq!(report.hostname.as_deref(), Some("mock-host"));
        assert_eq!(report.system.cpu_percent, Some(37.5));
        assert_eq!(report.system.load_ratio, Some(0.25));
        assert_eq!(report.system.disks.len(), 2);
        assert_eq!(
            report.system.disks[1].error.as_deref(),
            Some("Permission denied")
        );

        let GpuEntry::Ok(gpu) = &report.gpus[0] else {
            panic!("ожидалась GPU без ошибки");
        };
        assert_eq!(gpu.index, Some(0));
        assert_eq!(gpu.memory_percent, Some(50.0));
        assert_eq!(gpu.fan_speed_percent, None);
        assert_eq!(gpu.processes.len(), 4);
        assert!(matches!(gpu.processes[3], ProcessEntry::Err { .. }));
        assert_eq!(gpu.process_usernames, vec!["alice", "bob"]);
    }

    #[test]
    fn zero_cpu_differs_from_missing_cpu() {
        let zero = ExporterReport::from_value(&json!({"system": {"cpu_percent": 0}})).unwrap();
        let missing = ExporterReport::from_value(&json!({"system": {}})).unwrap();
        let garbage =
            ExporterReport::from_value(&json!({"system": {"cpu_percent": "N/A"}})).unwrap();

        assert_eq!(zero.system.cpu_percent, Some(0.0));
        assert_eq!(missing.system.cpu_percent, None);
        assert_eq!(garbage.system.cpu_percent, None);
    }

    #[test]
    fn cpu_percent_is_clamped() {
        let report =
            ExporterReport::from_value(&json!({"system": {"cpu_percent": 180.0}})).unwrap();
        assert_eq!(report.system.cpu_percent, Some(100.0));
    }

    #[test]
    fn exporter_error_is_reported() {
        let err = ExporterReport::from_value(&json!({"error": "nvml down"})).unwrap_err();
        assert_eq!(err, ReportError::Exporter("nvml down".to_string()));
        assert_eq!(
            ExporterReport::from_value(&json!([1, 2])).unwrap_err(),
            ReportError::NotAnObject
        );
    }

    #[test]
    fn gpu_failures_do_not_hide_other_devices() {
        let report = ExporterReport::from_value(&json!({
            "gpus": [
                {"error": "NVIDIA driver/library issue"},
                {"id": 1, "name": "ok gpu", "processes": []},
                "garbage"
            ]
        }))
        .unwrap();
        assert!(matches!(report.gpus[0], GpuEntry::Err { .. }));
        assert!(matches!(report.gpus[1], GpuEntry::Ok(_)));
        assert!(matches!(report.gpus[2], GpuEntry::Err { .. }));
    }

    #[test]
    fn no_gpu_notice_becomes_entry_error() {
        let report = ExporterReport::from_value(&json!({
            "gpus": [{"message": "No NVIDIA GPUs found or nvitop could not access them."}]
        }))
        .unwrap();
        assert_eq!(
            report.gpus,
            vec![GpuEntry::Err {
                error: "No NVIDIA GPUs found or nvitop could not access them.".to_string()
            }]
        );
    }

    #[test]
    fn system_error_keeps_unknowns() {
        let report = ExporterReport::from_value(&json!({
            "system": {"cpu_percent": null, "disks": [], "error": "Could not retrieve system metrics"}
        }))
        .unwrap();
        assert_eq!(report.system.cpu_percent, None);
        assert!(report.system.error.is_some());
    }

    #[test]
    fn serializes_unknown_as_null_and_gpu_errors_inline() {
        let gpus = vec![GpuEntry::Err {
            error: "boom".to_string(),
        }];
        let value = serde_json::to_value(&gpus).unwrap();
        assert_eq!(value, json!([{"error": "boom"}]));

        let value = serde_json::to_value(SystemStats::default()).unwrap();
        assert!(value["cpu_percent"].is_null());
        assert!(value.get("error").is_none());
    }
}
