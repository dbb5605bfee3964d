//! Scratch `/proc` + `/sys` trees for unit tests.

use std::fs;
use std::path::{Path, PathBuf};

use super::HostFs;

pub(crate) struct FakeHost {
    _dir: tempfile::TempDir,
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

/// Fields of a fake `/proc/<pid>/stat` line.
#[derive(Debug, Clone)]
pub(crate) struct FakePid {
    pub comm: &'static str,
    pub ppid: u32,
    pub minflt: u64,
    pub majflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub threads: u64,
    pub starttime: u64,
    pub rss_pages: u64,
}

impl Default for FakePid {
    fn default() -> Self {
        Self {
            comm: "llama-server",
            ppid: 1,
            minflt: 1000,
            majflt: 2,
            utime: 500,
            stime: 100,
            threads: 8,
            starttime: 4242,
            rss_pages: 2048,
        }
    }
}

pub(crate) fn stat_text(total_user: u64, idle: u64) -> String {
    format!(
        "cpu  {total_user} 0 0 {idle} 0 0 0 0 0 0\ncpu0 {total_user} 0 0 {idle} 0 0 0 0 0 0\n\
         intr 100 0\nctxt 1000\nprocesses 50\nsoftirq 10 0\n"
    )
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let proc_root = dir.path().join("proc");
        let sys_root = dir.path().join("sys");
        fs::create_dir_all(&proc_root).expect("mkdir proc");
        fs::create_dir_all(&sys_root).expect("mkdir sys");

        let host = Self {
            _dir: dir,
            proc_root,
            sys_root,
        };
        host.write_proc("stat", &stat_text(1000, 4000));
        host
    }

    pub fn fs(&self) -> HostFs {
        HostFs::new(&self.proc_root, &self.sys_root)
    }

    pub fn write_proc(&self, rel: &str, body: &str) {
        write(&self.proc_root.join(rel), body);
    }

    pub fn write_sys(&self, rel: &str, body: &str) {
        write(&self.sys_root.join(rel), body);
    }

    pub fn remove_proc(&self, rel: &str) {
        let path = self.proc_root.join(rel);
        if path.is_dir() {
            fs::remove_dir_all(path).expect("remove dir");
        } else {
            fs::remove_file(path).expect("remove file");
        }
    }

    pub fn add_pid(&self, pid: u32, p: &FakePid) {
        let stat = format!(
            "{pid} ({}) S {} {pid} {pid} 0 -1 4194304 {} 0 {} 0 {} {} 0 0 20 0 {} 0 {} 1000000 {} 18446744073709551615",
            p.comm, p.ppid, p.minflt, p.majflt, p.utime, p.stime, p.threads, p.starttime, p.rss_pages
        );
        let status = format!(
            "Name:\t{}\nPPid:\t{}\nVmRSS:\t{} kB\nThreads:\t{}\nvoluntary_ctxt_switches:\t{}\nnonvoluntary_ctxt_switches:\t{}\n",
            p.comm,
            p.ppid,
            p.rss_pages * 4,
            p.threads,
            p.minflt / 10,
            p.majflt
        );
        self.write_proc(&format!("{pid}/stat"), &stat);
        self.write_proc(&format!("{pid}/status"), &status);
        self.write_proc(&format!("{pid}/comm"), &format!("{}\n", p.comm));
    }
}

fn write(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir parent");
    }
    fs::write(path, body).expect("write fake file");
}
