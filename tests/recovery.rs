
use std::cell::{Cell, RefCell};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use pretty_assertions::assert_eq;

use clist::*;

type MemStore = BandStore<Cursor<Vec<u8>>>;

fn page_rect(cfg: &ClistConfig) -> IntRect {
    IntRect::new(0, 0, cfg.width, cfg.height)
}

fn replay_into(cfg: &ClistConfig, store: &mut MemStore, calls: &RefCell<Vec<DeviceCall>>) -> Result<()> {
    let mut reader = ClistReader::new(cfg.clone())?;
    let mut dev = RecordingDevice::new(page_rect(cfg));
    reader.play_page(store, &mut dev)?;
    calls.borrow_mut().extend(dev.take());
    Ok(())
}

/// Refuses reservations numbered `fail_from ..= fail_to`
struct Tight {
    cfg: ClistConfig,
    reserves: Rc<Cell<usize>>,
    fail_from: usize,
    fail_to: usize,
    frees: usize,
    partial_pages: Rc<Cell<usize>>,
    rendered: Rc<RefCell<Vec<DeviceCall>>>,
}

impl Tight {
    fn new(cfg: &ClistConfig, fail_from: usize, fail_to: usize, frees: usize) -> Self {
        Self {
            cfg: cfg.clone(),
            reserves: Rc::new(Cell::new(0)),
            fail_from,
            fail_to,
            frees,
            partial_pages: Rc::new(Cell::new(0)),
            rendered: Rc::new(RefCell::new(vec![])),
        }
    }
}

impl MemoryHandler<Cursor<Vec<u8>>> for Tight {
    fn reserve(&mut self, requested: usize) -> Result<()> {
        let n = self.reserves.get() + 1;
        self.reserves.set(n);
        if n >= self.fail_from && n <= self.fail_to {
            return Err(ClistError::OutOfMemory { requested, available: 0 });
        }
        Ok(())
    }
    fn free_up(&mut self) -> bool {
        if self.frees == 0 {
            return false;
        }
        self.frees -= 1;
        true
    }
    fn render_partial_page(&mut self, store: &mut MemStore) -> Result<()> {
        self.partial_pages.set(self.partial_pages.get() + 1);
        replay_into(&self.cfg, store, &self.rendered)
    }
}

fn rect_of(i: i32) -> IntRect {
    IntRect::new(i * 4, 0, i * 4 + 3, 8)
}

#[test]
fn retry_then_flush_keeps_every_intent() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let cfg = ClistConfig::new(64, 16, 16, 8);
    let handler = Tight::new(&cfg, 3, 4, 1);
    let reserves = handler.reserves.clone();
    let partial = handler.partial_pages.clone();
    let rendered = handler.rendered.clone();

    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap()
        .with_memory_handler(Box::new(handler));
    for i in 0 .. 6 {
        writer.fill_rectangle(rect_of(i), i as ColorIndex + 1).unwrap();
    }
    writer.end_page().unwrap();
    assert!(!writer.is_disabled());
    // Two refused, one retried after the flush
    assert_eq!(reserves.get(), 8);
    assert_eq!(partial.get(), 1);

    replay_into(&cfg, &mut writer.into_store(), &rendered).unwrap();
    let expect: Vec<DeviceCall> = (0 .. 6)
        .map(|i| DeviceCall::FillRectangle { rect: rect_of(i), color: i as ColorIndex + 1 })
        .collect();
    assert_eq!(*rendered.borrow(), expect);
}

#[test]
fn local_retry_only() {
    let cfg = ClistConfig::new(64, 16, 16, 8).with_retry_budget(3);
    let handler = Tight::new(&cfg, 2, 3, 5);
    let partial = handler.partial_pages.clone();
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap()
        .with_memory_handler(Box::new(handler));
    for i in 0 .. 3 {
        writer.fill_rectangle(rect_of(i), 1).unwrap();
    }
    assert_eq!(partial.get(), 0);
    writer.end_page().unwrap();
}

#[test]
fn out_of_memory_after_flush() {
    let cfg = ClistConfig::new(64, 16, 16, 8);
    let handler = Tight::new(&cfg, 3, usize::MAX, 0);
    let partial = handler.partial_pages.clone();
    let rendered = handler.rendered.clone();
    let mut writer = ClistWriter::new(cfg.clone(), BandStore::memory()).unwrap()
        .with_memory_handler(Box::new(handler));
    writer.fill_rectangle(rect_of(0), 1).unwrap();
    writer.fill_rectangle(rect_of(1), 2).unwrap();
    match writer.fill_rectangle(rect_of(2), 3) {
        Err(ClistError::OutOfMemory { .. }) => {},
        other => panic!("expected out of memory, got {:?}", other),
    }
    assert_eq!(partial.get(), 1);
    assert_eq!(rendered.borrow().len(), 2);
    // The caller may still try again
    assert!(!writer.is_disabled());
}

/// Stream whose writes fail once `broken` is set
struct Flaky {
    inner: Cursor<Vec<u8>>,
    broken: Rc<Cell<bool>>,
}

impl Read for Flaky {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Flaky {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.get() {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.inner.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Flaky {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl StoreStream for Flaky {
    fn truncate(&mut self) -> io::Result<()> {
        self.inner.truncate()
    }
}

fn flaky_store() -> (BandStore<Flaky>, Rc<Cell<bool>>) {
    let broken = Rc::new(Cell::new(false));
    let c = Flaky { inner: Cursor::new(vec![]), broken: broken.clone() };
    let b = Flaky { inner: Cursor::new(vec![]), broken: broken.clone() };
    (BandStore::new(c, b), broken)
}

#[test]
fn write_failure_on_flush_disables_writer() {
    let cfg = ClistConfig::new(64, 16, 16, 8);
    let (store, broken) = flaky_store();
    let mut writer = ClistWriter::new(cfg, store).unwrap();
    writer.fill_rectangle(rect_of(0), 1).unwrap();
    writer.flush().unwrap();
    writer.fill_rectangle(rect_of(1), 2).unwrap();

    broken.set(true);
    match writer.flush() {
        Err(ClistError::Io(_)) => {},
        other => panic!("expected an I/O error, got {:?}", other),
    }
    assert!(writer.is_disabled());
    broken.set(false);
    match writer.fill_rectangle(rect_of(2), 3) {
        Err(ClistError::PermanentError) => {},
        other => panic!("expected the writer disabled, got {:?}", other),
    }
    assert!(matches!(writer.end_page(), Err(ClistError::PermanentError)));
}

#[test]
fn write_failure_while_buffering() {
    let cfg = ClistConfig::new(64, 16, 16, 8).with_cbuf_size(256).with_buffer_size(384);
    let (store, broken) = flaky_store();
    let mut writer = ClistWriter::new(cfg, store).unwrap();
    broken.set(true);
    let mut failed = None;
    for i in 0 .. 200 {
        if let Err(e) = writer.fill_rectangle(rect_of(i % 16), i as ColorIndex) {
            failed = Some(e);
            break;
        }
    }
    match failed {
        Some(ClistError::Io(_)) => {},
        other => panic!("expected an I/O error, got {:?}", other),
    }
    assert!(writer.is_disabled());
    assert!(matches!(writer.put_params(&[1]), Err(ClistError::PermanentError)));
}
