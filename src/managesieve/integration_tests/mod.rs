//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Sievemap.
//
// Sievemap is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Sievemap is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Sievemap. If not, see <http://www.gnu.org/licenses/>.

//! Full-stack tests which run the real server, backends included, against a
//! scripted client.
//!
//! The tests share one system directory (a passwd file and a tree of user
//! homes) as long as they run concurrently; it is removed as soon as no test
//! is using it. Script-modifying tests each log in as their own user so they
//! can't see each other's scripts.
//!
//! Each connection gets a dedicated server thread with its own current-thread
//! runtime, talking to the client over a `UnixStream` pair.


mod framing;
mod scripts;
mod shutdown;
mod tls;
