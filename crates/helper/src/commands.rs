//! Implementations of the JSON helper commands
//!
//! Every function takes the filesystem roots it reads from so the same code
//! runs against `/` inside a container and against fixture trees in tests.

use crate::protocol::{
    CollectInputRequest, CountThreadResponse, CountZombiesResponse, FileNode, InspectResponse,
    ListFilesRequest, PreviewLogRequest, PreviewLogResponse, ProcessInfo,
};
use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Fields parsed out of `/proc/<pid>/stat`
#[derive(Debug, Clone, PartialEq)]
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub state: String,
    pub ppid: i32,
    pub threads: u32,
}

/// Parse the content of `/proc/<pid>/stat`
///
/// `comm` may contain spaces and parentheses, so the split happens on the
/// last `)`.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_string();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();

    // rest[0] is field 3 (state); num_threads is field 20
    let state = rest.first()?.to_string();
    let ppid = rest.get(1)?.parse().ok()?;
    let threads = rest.get(17)?.parse().ok()?;

    Some(ProcStat {
        pid,
        comm,
        state,
        ppid,
        threads,
    })
}

fn read_all_stats(proc_root: &Path) -> Result<Vec<ProcStat>> {
    let mut stats = Vec::new();
    let entries = fs::read_dir(proc_root)
        .with_context(|| format!("Failed to read {}", proc_root.display()))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        // Processes may exit between readdir and read
        if let Ok(content) = fs::read_to_string(entry.path().join("stat")) {
            if let Some(stat) = parse_proc_stat(&content) {
                stats.push(stat);
            }
        }
    }

    Ok(stats)
}

fn read_cmdline(proc_root: &Path, pid: i32) -> Vec<String> {
    fs::read(proc_root.join(pid.to_string()).join("cmdline"))
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// `inspect`: identity of the container as seen from inside
pub fn inspect(root: &Path, proc_root: &Path) -> Result<InspectResponse> {
    let hostname = fs::read_to_string(root.join("etc/hostname"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let pid1_comm = fs::read_to_string(proc_root.join("1/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let tz = std::env::var("TZ").ok();

    Ok(InspectResponse {
        hostname,
        pid1_comm,
        uid: current_uid(proc_root),
        env,
        tz,
    })
}

fn current_uid(proc_root: &Path) -> u32 {
    fs::read_to_string(proc_root.join("self/status"))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("Uid:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(0)
}

/// `listFiles`: directory tree under `req.name`
pub fn list_files(req: &ListFilesRequest) -> Result<Vec<FileNode>> {
    let root = Path::new(&req.name);
    let meta = fs::metadata(root).with_context(|| format!("stat {}", req.name))?;
    if !meta.is_dir() {
        bail!("{} is not a directory", req.name);
    }
    walk(root, req, 1)
}

fn walk(dir: &Path, req: &ListFilesRequest, depth: usize) -> Result<Vec<FileNode>> {
    let mut nodes = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("readdir {}", dir.display()))?
        .flatten()
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        let mod_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        if meta.is_dir() {
            let children = if depth < req.max_depth {
                walk(&path, req, depth + 1).unwrap_or_default()
            } else {
                Vec::new()
            };
            if req.include_dirs || !children.is_empty() {
                nodes.push(FileNode {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: path.to_string_lossy().into_owned(),
                    dir: true,
                    size: 0,
                    mod_time,
                    children,
                });
            }
        } else {
            nodes.push(FileNode {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: path.to_string_lossy().into_owned(),
                dir: false,
                size: meta.len(),
                mod_time,
                children: Vec::new(),
            });
        }
    }

    Ok(nodes)
}

/// `previewLog`: the last lines of a file, bounded by bytes and lines
pub fn preview_log(req: &PreviewLogRequest) -> Result<PreviewLogResponse> {
    let mut file = fs::File::open(&req.path).with_context(|| format!("open {}", req.path))?;
    let file_size = file.metadata()?.len();
    let start = file_size.saturating_sub(req.max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((file_size - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    // A cut in the middle of the file leaves a partial first line
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let mut truncated = start > 0;
    if lines.len() > req.max_lines {
        lines.drain(..lines.len() - req.max_lines);
        truncated = true;
    }

    Ok(PreviewLogResponse {
        path: req.path.clone(),
        file_size,
        lines,
        truncated,
    })
}

/// `processes <pid>`: `pid` and all of its descendants
pub fn processes(proc_root: &Path, pid: i32) -> Result<Vec<ProcessInfo>> {
    let stats = read_all_stats(proc_root)?;
    if !stats.iter().any(|s| s.pid == pid) {
        bail!("process {} not found", pid);
    }

    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for s in &stats {
        children.entry(s.ppid).or_default().push(s.pid);
    }

    let mut wanted = HashSet::new();
    let mut stack = vec![pid];
    while let Some(p) = stack.pop() {
        if wanted.insert(p) {
            if let Some(kids) = children.get(&p) {
                stack.extend(kids);
            }
        }
    }

    let mut result: Vec<ProcessInfo> = stats
        .into_iter()
        .filter(|s| wanted.contains(&s.pid))
        .map(|s| ProcessInfo {
            cmdline: read_cmdline(proc_root, s.pid),
            pid: s.pid,
            ppid: s.ppid,
            comm: s.comm,
            state: s.state,
            threads: s.threads,
        })
        .collect();
    result.sort_by_key(|p| p.pid);
    Ok(result)
}

/// `countZombies`
pub fn count_zombies(proc_root: &Path) -> Result<CountZombiesResponse> {
    let zombies = read_all_stats(proc_root)?
        .iter()
        .filter(|s| s.state == "Z")
        .count();
    Ok(CountZombiesResponse { zombies })
}

/// `countThread`
pub fn count_thread(proc_root: &Path) -> Result<CountThreadResponse> {
    let threads = read_all_stats(proc_root)?
        .iter()
        .map(|s| s.threads as usize)
        .sum();
    Ok(CountThreadResponse { threads })
}

/// `glob <pattern>`
pub fn glob_paths(pattern: &str) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("bad pattern {pattern}"))? {
        if let Ok(path) = entry {
            paths.push(path.to_string_lossy().into_owned());
        }
    }
    Ok(paths)
}

/// `collectInput`: no input plugins ship with this helper
pub fn collect_input(req: &CollectInputRequest) -> Result<serde_json::Value> {
    bail!("no input plugin registered for type '{}'", req.input_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_proc(root: &Path, pid: i32, comm: &str, state: &str, ppid: i32, threads: u32) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let stat = format!(
            "{pid} ({comm}) {state} {ppid} 1 1 0 -1 4194560 100 0 0 0 10 5 0 0 20 0 {threads} 0 12345 1000 200"
        );
        fs::write(dir.join("stat"), stat).unwrap();
        fs::write(dir.join("cmdline"), format!("{comm}\0--flag\0")).unwrap();
    }

    #[test]
    fn test_parse_proc_stat_with_spaces_in_comm() {
        let stat = parse_proc_stat(
            "42 (my (odd) proc) S 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 7 0 1 1 1",
        )
        .unwrap();

        assert_eq!(stat.pid, 42);
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.state, "S");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.threads, 7);
    }

    #[test]
    fn test_processes_returns_subtree() {
        let temp = TempDir::new().unwrap();
        write_proc(temp.path(), 1, "tini", "S", 0, 1);
        write_proc(temp.path(), 10, "java", "S", 1, 40);
        write_proc(temp.path(), 11, "sh", "S", 10, 1);
        write_proc(temp.path(), 20, "sidecar", "S", 1, 2);

        let procs = processes(temp.path(), 10).unwrap();
        let pids: Vec<i32> = procs.iter().map(|p| p.pid).collect();

        assert_eq!(pids, vec![10, 11]);
        assert_eq!(procs[0].cmdline, vec!["java", "--flag"]);
    }

    #[test]
    fn test_processes_unknown_pid() {
        let temp = TempDir::new().unwrap();
        write_proc(temp.path(), 1, "init", "S", 0, 1);

        assert!(processes(temp.path(), 99).is_err());
    }

    #[test]
    fn test_count_zombies_and_threads() {
        let temp = TempDir::new().unwrap();
        write_proc(temp.path(), 1, "init", "S", 0, 1);
        write_proc(temp.path(), 2, "defunct", "Z", 1, 1);
        write_proc(temp.path(), 3, "worker", "R", 1, 8);
        fs::create_dir_all(temp.path().join("self")).unwrap();

        assert_eq!(count_zombies(temp.path()).unwrap().zombies, 1);
        assert_eq!(count_thread(temp.path()).unwrap().threads, 10);
    }

    #[test]
    fn test_preview_log_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.log");
        let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, &content).unwrap();

        let resp = preview_log(&PreviewLogRequest {
            path: path.to_string_lossy().into_owned(),
            max_bytes: 4096,
            max_lines: 3,
        })
        .unwrap();

        assert_eq!(resp.lines, vec!["line 8", "line 9", "line 10"]);
        assert_eq!(resp.file_size, content.len() as u64);
        assert!(resp.truncated);
    }

    #[test]
    fn test_preview_log_drops_partial_first_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.log");
        fs::write(&path, "aaaaaaaaaa\nbbbb\ncccc\n").unwrap();

        let resp = preview_log(&PreviewLogRequest {
            path: path.to_string_lossy().into_owned(),
            max_bytes: 12,
            max_lines: 100,
        })
        .unwrap();

        assert_eq!(resp.lines, vec!["bbbb", "cccc"]);
    }

    #[test]
    fn test_list_files_depth_and_dirs() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        fs::create_dir_all(temp.path().join("empty")).unwrap();
        fs::write(temp.path().join("a/one.log"), "1").unwrap();
        fs::write(temp.path().join("a/b/two.log"), "22").unwrap();

        let req = ListFilesRequest {
            name: temp.path().to_string_lossy().into_owned(),
            include_dirs: false,
            max_depth: 3,
        };
        let nodes = list_files(&req).unwrap();

        // "empty" has no files and dirs are not requested
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "a");
        assert_eq!(nodes[0].children.len(), 2);

        let shallow = ListFilesRequest {
            max_depth: 1,
            include_dirs: true,
            ..req
        };
        let nodes = list_files(&shallow).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.children.is_empty()));
    }

    #[test]
    fn test_glob_paths() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("x.log"), "").unwrap();
        fs::write(temp.path().join("y.log"), "").unwrap();
        fs::write(temp.path().join("z.txt"), "").unwrap();

        let pattern = format!("{}/*.log", temp.path().display());
        let mut paths = glob_paths(&pattern).unwrap();
        paths.sort();

        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("x.log"));
    }

    #[test]
    fn test_collect_input_is_unsupported() {
        let err = collect_input(&CollectInputRequest {
            input_type: "jvm".to_string(),
            config: serde_json::Value::Null,
        })
        .unwrap_err();

        assert!(err.to_string().contains("jvm"));
    }
}
