//! Embedded preview page served at `/`.
//!
//! Kept as a `&'static str` so the binary needs no asset directory.

pub const PREVIEW_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>npu-detect preview</title>
<style>
  body { margin: 0; background: #111; color: #ddd; font: 14px monospace; }
  header { padding: 8px 12px; background: #222; display: flex; gap: 24px; }
  main { display: flex; gap: 12px; padding: 12px; }
  img { max-width: 75vw; border: 1px solid #333; }
  ol { margin: 0; padding-left: 20px; max-height: 80vh; overflow-y: auto; }
</style>
</head>
<body>
<header>
  <span>npu-detect</span>
  <span id="fps">fps: -</span>
  <span id="frame">frame: -</span>
  <a href="/metrics" style="color:#8cf">metrics</a>
</header>
<main>
  <img src="/stream.mjpg" alt="annotated stream">
  <ol id="detections"></ol>
</main>
<script>
async function poll() {
  try {
    const res = await fetch('/detections');
    if (res.status === 200) {
      const snap = await res.json();
      document.getElementById('fps').textContent = 'fps: ' + snap.fps.toFixed(1);
      document.getElementById('frame').textContent = 'frame: ' + snap.frame_number;
      const list = document.getElementById('detections');
      list.innerHTML = '';
      for (const det of snap.detections) {
        const item = document.createElement('li');
        item.textContent = det.label + ' ' + (det.score * 100).toFixed(1) + '% ['
          + det.bbox.map(v => v.toFixed(0)).join(', ') + ']';
        list.appendChild(item);
      }
    }
  } catch (_) {}
  setTimeout(poll, 250);
}
poll();
</script>
</body>
</html>
"#;
